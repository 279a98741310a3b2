//! # md64_loader
//! Loader and dynamic linker for MD64 driver modules on segmented x86 memory.
//! ## Usage
//! A module image is validated, placed in a paragraph-aligned reservation,
//! relocated for its base selector, linked against the global symbol registry
//! and initialised. After init its cold region can be handed back to the
//! arena. Every address the loader produces is a `selector:offset` pair
//! ([`addr::FarPtr`]).
//!
//! The memory provider ([`arena::Arena`]), the calling convention used for
//! entry points ([`lifecycle::EntryDispatcher`]) and the clock are
//! collaborators supplied by the host; defaults are provided for all three.
//! ## Example
//! ```no_run
//! use md64_loader::{Loader, input::ModuleBinary};
//!
//! let bytes = std::fs::read("MODULES/NE2000.MOD").unwrap();
//! let mut loader = Loader::new();
//! let nic = loader.load_module(ModuleBinary::new("NE2000.MOD", &bytes)).unwrap();
//! let version = loader.resolve_symbol("version").unwrap();
//! println!("version() = 0x{:08x}", loader.invoke(version).unwrap().value());
//! loader.unload_module(nic).unwrap();
//! ```
#![no_std]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

pub mod addr;
pub mod arena;
mod error;
pub mod header;
pub mod host;
pub mod input;
pub mod lifecycle;
mod loader;
mod macros;
pub mod registry;
pub mod relocation;
pub mod segment;
pub mod symbol;
pub mod thunk;

pub use error::{Error, ErrorClass, custom_error};
pub use lifecycle::{ModuleHandle, ModuleInstance, ModuleState};
pub use loader::{INIT_BUDGET_US, Loader, LoaderStats, MAX_MODULES};

/// A type alias for `Result`s returned by `md64_loader` functions.
///
/// This is a convenience alias that eliminates the need to repeatedly specify
/// the `Error` type in function signatures.
pub type Result<T> = core::result::Result<T, Error>;
