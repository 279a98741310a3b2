//! Relocation of module images
//!
//! Relocation runs in two passes. The first decodes every entry, checks it
//! against the reservation and resolves imports; the second writes the
//! patches. A table that fails the first pass leaves memory untouched.

use crate::{
    Error, Result,
    addr::FarPtr,
    arena::Arena,
    error::symbol_not_found,
    header::ModuleHeader,
    segment::ModuleSegments,
    symbol::{SYMBOL_NAME_LEN, SymbolLookup, SymbolName},
};
use alloc::{borrow::ToOwned, vec::Vec};

/// Size of a relocation entry in bytes.
pub const RELOC_ENTRY_SIZE: usize = 6;

/// Relocation types understood by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RelocKind {
    /// Far pointer; its selector word becomes `base + aux`.
    SegOfs = 0x01,
    /// Word that becomes `base + aux`.
    Segment = 0x02,
    /// Module-relative offset word. Checked, never rewritten.
    Offset = 0x03,
    /// Near displacement. Checked, never rewritten.
    RelNear = 0x04,
    /// Far call target; the selector word at `offset + 2` becomes `base + aux`.
    RelFar = 0x05,
    /// Far pointer bound to the global symbol named at image offset `aux`.
    ImportFar = 0x06,
}

impl RelocKind {
    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => RelocKind::SegOfs,
            0x02 => RelocKind::Segment,
            0x03 => RelocKind::Offset,
            0x04 => RelocKind::RelNear,
            0x05 => RelocKind::RelFar,
            0x06 => RelocKind::ImportFar,
            _ => return None,
        })
    }

    /// Number of bytes at `offset` the entry covers.
    #[inline]
    pub fn width(self) -> usize {
        match self {
            RelocKind::Segment | RelocKind::Offset | RelocKind::RelNear => 2,
            RelocKind::SegOfs | RelocKind::RelFar | RelocKind::ImportFar => 4,
        }
    }
}

/// One decoded relocation entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelocationEntry {
    /// Raw type tag as stored.
    pub kind: u8,
    pub offset: u16,
    pub aux: u16,
}

impl RelocationEntry {
    #[inline]
    fn parse(bytes: &[u8]) -> Self {
        Self {
            kind: bytes[0],
            offset: u16::from_le_bytes([bytes[2], bytes[3]]),
            aux: u16::from_le_bytes([bytes[4], bytes[5]]),
        }
    }
}

/// Decodes the relocation table declared by `header` out of `image`.
///
/// The header validator has already checked that the table lies within the
/// file, so this only slices.
pub fn relocation_table(header: &ModuleHeader, image: &[u8]) -> Vec<RelocationEntry> {
    let start = header.reloc_table_offset as usize;
    let end = start + header.reloc_count as usize * RELOC_ENTRY_SIZE;
    image
        .get(start..end)
        .unwrap_or(&[])
        .chunks_exact(RELOC_ENTRY_SIZE)
        .map(RelocationEntry::parse)
        .collect()
}

enum Patch {
    /// Write a word at the offset.
    Word(u16, u16),
    /// Write a far pointer at the offset.
    Far(u16, FarPtr),
    /// Bounds check only.
    Keep,
}

fn plan<A: Arena, S: SymbolLookup + ?Sized>(
    arena: &A,
    segments: &ModuleSegments,
    index: usize,
    entry: &RelocationEntry,
    imports: &S,
) -> Result<Patch> {
    let Some(kind) = RelocKind::from_raw(entry.kind) else {
        return Err(Error::UnknownRelocation {
            index,
            kind: entry.kind,
        });
    };
    let limit = segments.total_bytes();
    let out_of_bounds = |offset: u16, width: usize| Error::RelocationOutOfBounds {
        index,
        offset,
        width,
        limit,
    };
    if entry.offset as usize + kind.width() > limit {
        return Err(out_of_bounds(entry.offset, kind.width()));
    }
    let selector = segments.base().wrapping_add(entry.aux);
    let patch = match kind {
        RelocKind::Segment => Patch::Word(entry.offset, selector),
        RelocKind::SegOfs | RelocKind::RelFar => Patch::Word(entry.offset + 2, selector),
        RelocKind::Offset | RelocKind::RelNear => Patch::Keep,
        RelocKind::ImportFar => {
            if entry.aux as usize + SYMBOL_NAME_LEN > limit {
                return Err(out_of_bounds(entry.aux, SYMBOL_NAME_LEN));
            }
            let mut raw = [0u8; SYMBOL_NAME_LEN];
            arena.read(FarPtr::new(segments.base(), entry.aux), &mut raw)?;
            let name = SymbolName::from_raw(raw);
            let target = imports
                .lookup(name.as_str())
                .ok_or_else(|| symbol_not_found(name.as_str().to_owned()))?;
            Patch::Far(entry.offset, target)
        }
    };
    Ok(patch)
}

/// Applies `table` to the module in `segments`.
///
/// Returns the number of entries applied. On error nothing has been written.
pub fn apply_relocations<A: Arena, S: SymbolLookup + ?Sized>(
    arena: &mut A,
    segments: &ModuleSegments,
    table: &[RelocationEntry],
    imports: &S,
) -> Result<usize> {
    let patches = table
        .iter()
        .enumerate()
        .map(|(index, entry)| plan(arena, segments, index, entry, imports))
        .collect::<Result<Vec<_>>>()?;

    let base = segments.base();
    for patch in &patches {
        match *patch {
            Patch::Word(offset, value) => arena.write_u16(FarPtr::new(base, offset), value)?,
            Patch::Far(offset, target) => {
                arena.write(FarPtr::new(base, offset), &target.to_le_bytes())?
            }
            Patch::Keep => {}
        }
    }
    #[cfg(feature = "log")]
    log::trace!(
        "[Relocate] base 0x{:04x}: {} entries applied",
        base,
        patches.len()
    );
    Ok(patches.len())
}
