//! Memory arena operations for the module loader
//!
//! This module provides the trait the loader uses to reserve, access and
//! release memory for module instances, together with the default
//! paragraph-granular implementation.
//!
//! Key concepts:
//! - **Memory class**: conventional memory below 640 KiB or upper memory blocks.
//! - **Placement**: the policy that decides which class a module lands in.
//! - **Partial free**: a reservation can be shrunk by freeing any sub-range of
//!   it, which is how a module's cold region is returned after init.
//!
//! # Safety
//! Nothing here is `unsafe`; the arena owns its backing bytes and every access
//! is bounds-checked against the pool it falls in.

mod paragraph;

pub use paragraph::{ParagraphArena, PoolSpec};

use crate::{
    Result,
    addr::{FarPtr, Selector},
};

/// The kind of memory a reservation is carved from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Conventional memory, always present.
    Conventional,
    /// Upper memory blocks between the video area and the BIOS.
    Upper,
}

/// Policy selecting the memory class of a new module reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Placement {
    /// Always use conventional memory.
    #[default]
    Conventional,
    /// Try upper memory first and fall back to conventional memory.
    PreferUpper,
}

impl Placement {
    /// Memory classes to try, in order.
    pub fn classes(self) -> &'static [MemoryClass] {
        match self {
            Placement::Conventional => &[MemoryClass::Conventional],
            Placement::PreferUpper => &[MemoryClass::Upper, MemoryClass::Conventional],
        }
    }
}

/// A trait for the memory provider the loader places modules in.
///
/// Sizes are in bytes and are rounded up to whole paragraphs by the
/// implementation. Addresses are always `selector:offset` pairs.
///
/// # Example
/// ```rust
/// use md64_loader::arena::{Arena, MemoryClass, ParagraphArena};
/// use md64_loader::addr::FarPtr;
///
/// let mut arena = ParagraphArena::default();
/// let seg = arena.allocate(64, 16, MemoryClass::Conventional).unwrap();
/// arena.write(FarPtr::new(seg, 0), b"MD64").unwrap();
/// arena.free(seg, 64).unwrap();
/// assert_eq!(arena.used_bytes(), 0);
/// ```
pub trait Arena {
    /// Reserves `len` bytes aligned to `align` bytes from `class`.
    ///
    /// Returns the selector of the first paragraph. Memory handed out is
    /// zero-filled.
    fn allocate(&mut self, len: usize, align: usize, class: MemoryClass) -> Result<Selector>;

    /// Returns `len` bytes starting at paragraph `base` to the arena.
    ///
    /// The range may be any paragraph-aligned part of an earlier reservation.
    fn free(&mut self, base: Selector, len: usize) -> Result<()>;

    /// Copies bytes starting at `addr` into `buf`.
    fn read(&self, addr: FarPtr, buf: &mut [u8]) -> Result<()>;

    /// Copies `data` into memory starting at `addr`.
    fn write(&mut self, addr: FarPtr, data: &[u8]) -> Result<()>;

    /// Fills `len` bytes starting at `addr` with `byte`.
    fn fill(&mut self, addr: FarPtr, len: usize, byte: u8) -> Result<()>;

    /// Number of bytes currently reserved across all classes.
    fn used_bytes(&self) -> usize;

    /// Total number of bytes `class` can hold, or 0 if it is absent.
    fn capacity(&self, class: MemoryClass) -> usize;

    /// Reads a little-endian word at `addr`.
    fn read_u16(&self, addr: FarPtr) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Writes a little-endian word at `addr`.
    fn write_u16(&mut self, addr: FarPtr, val: u16) -> Result<()> {
        self.write(addr, &val.to_le_bytes())
    }
}
