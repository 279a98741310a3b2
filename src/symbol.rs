//! Module export tables
//!
//! This module provides the fixed-width symbol names used by the image format,
//! the per-module export table with its binary-search lookup, and the
//! [`SymbolLookup`] trait the relocation engine uses to bind imports.

use crate::addr::FarPtr;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::{
    cmp::Ordering,
    fmt::{Debug, Display},
};

/// Size of an export directory entry in bytes.
pub const EXPORT_ENTRY_SIZE: usize = 12;
/// Length of a symbol name field; shorter names are NUL padded.
pub const SYMBOL_NAME_LEN: usize = 8;

/// A symbol name as stored in the image: up to 8 bytes, NUL padded.
///
/// Ordering is bytewise on the padded form, which matches the ordering of the
/// unpadded strings because NUL sorts before every printable byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolName([u8; SYMBOL_NAME_LEN]);

impl SymbolName {
    /// Builds a name from a string. Returns `None` if it does not fit or
    /// contains a NUL byte.
    pub fn new(name: &str) -> Option<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > SYMBOL_NAME_LEN || bytes.contains(&0) {
            return None;
        }
        let mut raw = [0u8; SYMBOL_NAME_LEN];
        raw[..bytes.len()].copy_from_slice(bytes);
        Some(Self(raw))
    }

    /// Takes the name field exactly as stored in the image.
    #[inline]
    pub fn from_raw(raw: [u8; SYMBOL_NAME_LEN]) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.0.iter().position(|b| *b == 0).unwrap_or(SYMBOL_NAME_LEN);
        &self.0[..len]
    }

    /// The name as text; non-UTF-8 names read as `"?"`.
    #[inline]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("?")
    }
}

impl Display for SymbolName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Debug for SymbolName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

bitflags! {
    /// Attributes of an exported symbol.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SymbolFlags: u16 {
        /// The symbol is callable.
        const FUNCTION = 0x0001;
        /// The symbol is data.
        const DATA = 0x0002;
        /// Callers must use a far call.
        const FAR_CALL = 0x0004;
        /// Safe to call from interrupt context.
        const ISR_SAFE = 0x0008;
    }
}

/// One entry of a module's export directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: SymbolName,
    /// Offset of the symbol from the module base.
    pub offset: u16,
    pub flags: SymbolFlags,
}

impl ExportEntry {
    fn parse(bytes: &[u8]) -> Self {
        let mut raw = [0u8; SYMBOL_NAME_LEN];
        raw.copy_from_slice(&bytes[..SYMBOL_NAME_LEN]);
        Self {
            name: SymbolName(raw),
            offset: u16::from_le_bytes([bytes[8], bytes[9]]),
            flags: SymbolFlags::from_bits_retain(u16::from_le_bytes([bytes[10], bytes[11]])),
        }
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        self.flags.contains(SymbolFlags::FUNCTION)
    }
}

/// A module's export directory, in image order.
///
/// The loader does not sort the table; it refuses tables that are not
/// strictly ascending (see [`ExportTable::first_unsorted`]) so that
/// [`ExportTable::lookup`] is always well defined.
#[derive(Clone, Debug, Default)]
pub struct ExportTable {
    entries: Vec<ExportEntry>,
}

impl ExportTable {
    /// Decodes consecutive 12-byte entries from `bytes`.
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            entries: bytes
                .chunks_exact(EXPORT_ENTRY_SIZE)
                .map(ExportEntry::parse)
                .collect(),
        }
    }

    #[inline]
    pub fn entries(&self) -> &[ExportEntry] {
        &self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the first entry that does not sort strictly after its
    /// predecessor, or `None` if the table is ordered.
    pub fn first_unsorted(&self) -> Option<usize> {
        self.entries
            .windows(2)
            .position(|pair| pair[0].name >= pair[1].name)
            .map(|idx| idx + 1)
    }

    /// Binary search for an exact name match.
    pub fn lookup(&self, name: &str) -> Option<&ExportEntry> {
        let key = SymbolName::new(name)?;
        let (mut lo, mut hi) = (0usize, self.entries.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.entries[mid].name.cmp(&key) {
                Ordering::Equal => return Some(&self.entries[mid]),
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
            }
        }
        None
    }
}

/// A trait for looking up symbols during relocation.
///
/// # Examples
/// ```rust
/// use md64_loader::{addr::FarPtr, symbol::SymbolLookup};
///
/// let lookup = |name: &str| match name {
///     "pktdrv" => Some(FarPtr::new(0x2000, 0x0100)),
///     _ => None,
/// };
/// assert!(lookup.lookup("pktdrv").is_some());
/// ```
pub trait SymbolLookup {
    /// Finds the address of a symbol by its name.
    fn lookup(&self, name: &str) -> Option<FarPtr>;
}

impl<F: ?Sized> SymbolLookup for F
where
    F: Fn(&str) -> Option<FarPtr>,
{
    fn lookup(&self, name: &str) -> Option<FarPtr> {
        self(name)
    }
}

impl SymbolLookup for () {
    fn lookup(&self, _name: &str) -> Option<FarPtr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(names: &[&str]) -> ExportTable {
        let mut bytes = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let mut raw = [0u8; SYMBOL_NAME_LEN];
            raw[..name.len()].copy_from_slice(name.as_bytes());
            bytes.extend_from_slice(&raw);
            bytes.extend_from_slice(&(0x100 + i as u16 * 0x10).to_le_bytes());
            bytes.extend_from_slice(&SymbolFlags::FUNCTION.bits().to_le_bytes());
        }
        ExportTable::parse(&bytes)
    }

    #[test]
    fn binary_search_finds_every_export() {
        let exports = table(&["cleanup", "hello", "version"]);
        assert_eq!(exports.first_unsorted(), None);
        assert_eq!(exports.lookup("cleanup").unwrap().offset, 0x100);
        assert_eq!(exports.lookup("hello").unwrap().offset, 0x110);
        assert_eq!(exports.lookup("version").unwrap().offset, 0x120);
        assert!(exports.lookup("nonexistent").is_none());
        assert!(exports.lookup("help").is_none());
        assert!(exports.lookup("").is_none());
    }

    #[test]
    fn prefix_sorts_first() {
        let exports = table(&["pkt", "pktsend"]);
        assert_eq!(exports.first_unsorted(), None);
        assert_eq!(exports.lookup("pkt").unwrap().offset, 0x100);
    }

    #[test]
    fn detects_disorder_and_duplicates() {
        assert_eq!(table(&["hello", "cleanup"]).first_unsorted(), Some(1));
        assert_eq!(table(&["a", "b", "b"]).first_unsorted(), Some(2));
    }
}
