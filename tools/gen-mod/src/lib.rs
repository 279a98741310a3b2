//! `gen-mod` generates MD64 module images, specifically designed for testing
//! module loaders.

mod common;
pub mod stub;
mod writer;

pub use common::{Entry, ExportDesc, Region, RelocDesc, RelocKind, Target, flags};
pub use writer::{ModuleImage, ModuleWriter, checksum16, seal};
