//! Module image sources
//!
//! The loader reads an image through [`ImageReader`], so it does not care
//! whether the bytes come from memory or from a file. Reading is the only
//! place a load may block.

pub use backend::ModuleBinary;
#[cfg(feature = "fs")]
pub use backend::ModuleFile;
pub use traits::{ImageReader, IntoImageReader};

mod backend;
mod traits;

use crate::{
    Result,
    error::header_error,
    header::{HEADER_SIZE, HeaderField},
};
use alloc::{format, vec};
use alloc::vec::Vec;

/// Largest image the format can describe: 0x1000 paragraphs.
pub(crate) const MAX_IMAGE_LEN: usize = 0x1_0000;

/// Reads the whole image out of `reader`.
pub(crate) fn read_image<R: ImageReader + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.len()?;
    if !(HEADER_SIZE..=MAX_IMAGE_LEN).contains(&len) {
        return Err(header_error(
            HeaderField::Length,
            format!("{}: image of {len} bytes", reader.shortname()),
        ));
    }
    let mut image = vec![0u8; len];
    reader.read(&mut image, 0)?;
    Ok(image)
}
