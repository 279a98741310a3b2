//! The memory reservation of a module instance
//!
//! A reservation has two lifetimes: the resident part lives as long as the
//! module, the cold part can be handed back once after init. After that the
//! cold byte range is dead: [`ModuleSegments::address`] refuses it, and so
//! does every lookup built on top of it.

use crate::{
    Result,
    addr::{FarPtr, PARAGRAPH, Selector, para_to_bytes},
    arena::{Arena, MemoryClass, Placement},
    error::state_error,
    header::ModuleHeader,
};
use core::{fmt::Debug, ops::Range};

/// The memory held by one module instance.
///
/// This is the handle the allocator needs to give the memory back; it is not
/// `Clone`, so a reservation can only be released once.
pub struct ModuleSegments {
    base: Selector,
    class: MemoryClass,
    total_para: u16,
    resident_para: u16,
    cold_para: u16,
    bss_para: u16,
    cold_reclaimed: bool,
}

impl Debug for ModuleSegments {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleSegments")
            .field("base", &format_args!("0x{:04x}", self.base))
            .field("class", &self.class)
            .field("total_para", &self.total_para)
            .field("cold_para", &self.cold_para)
            .field("cold_reclaimed", &self.cold_reclaimed)
            .finish()
    }
}

impl ModuleSegments {
    /// Base selector of the module.
    #[inline]
    pub fn base(&self) -> Selector {
        self.base
    }

    #[inline]
    pub fn class(&self) -> MemoryClass {
        self.class
    }

    /// Size of the original reservation in bytes.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        para_to_bytes(self.total_para)
    }

    /// Bytes still held in the arena.
    #[inline]
    pub fn held_bytes(&self) -> usize {
        if self.cold_reclaimed {
            self.total_bytes() - para_to_bytes(self.cold_para)
        } else {
            self.total_bytes()
        }
    }

    #[inline]
    pub fn cold_range(&self) -> Range<usize> {
        let start = para_to_bytes(self.resident_para);
        start..start + para_to_bytes(self.cold_para)
    }

    #[inline]
    pub fn bss_range(&self) -> Range<usize> {
        let total = self.total_bytes();
        total - para_to_bytes(self.bss_para)..total
    }

    #[inline]
    pub fn is_cold_reclaimed(&self) -> bool {
        self.cold_reclaimed
    }

    /// Whether `offset..offset + len` lies entirely in memory the module still owns.
    pub fn is_live(&self, offset: usize, len: usize) -> bool {
        let end = offset + len;
        if end > self.total_bytes() {
            return false;
        }
        if self.cold_reclaimed {
            let cold = self.cold_range();
            let overlaps = offset < cold.end && end > cold.start;
            return !overlaps;
        }
        true
    }

    /// Translates a module offset into an address, if that byte is still owned.
    #[inline]
    pub fn address(&self, offset: u16) -> Option<FarPtr> {
        self.is_live(offset as usize, 1)
            .then(|| FarPtr::new(self.base, offset))
    }

    /// Whether a linear address falls inside the memory the module still owns.
    pub fn contains_linear(&self, linear: u32) -> Option<u16> {
        let start = self.base as u32 * PARAGRAPH as u32;
        let offset = linear.checked_sub(start)? as usize;
        (offset <= u16::MAX as usize && self.is_live(offset, 1)).then_some(offset as u16)
    }
}

/// Reserves, shrinks and releases module memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentAllocator {
    placement: Placement,
}

impl SegmentAllocator {
    pub fn new(placement: Placement) -> Self {
        Self { placement }
    }

    #[inline]
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Reserves `total_size` paragraphs for `header`, copies `image` to the
    /// base of the reservation and zeroes the BSS.
    ///
    /// Classes are tried in placement order; exhaustion of the last one is
    /// reported and never retried.
    pub fn reserve<A: Arena>(
        &self,
        arena: &mut A,
        header: &ModuleHeader,
        image: &[u8],
    ) -> Result<ModuleSegments> {
        let len = header.total_bytes();
        let align = header.alignment_bytes();
        let mut last_err = None;
        let mut reserved = None;
        for &class in self.placement.classes() {
            match arena.allocate(len, align, class) {
                Ok(base) => {
                    reserved = Some((base, class));
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let Some((base, class)) = reserved else {
            return Err(last_err.unwrap_or_else(|| state_error("no memory class to allocate from")));
        };
        let segments = ModuleSegments {
            base,
            class,
            total_para: header.total_size_para,
            resident_para: header.resident_size_para,
            cold_para: header.cold_size_para,
            bss_para: header.bss_size_para,
            cold_reclaimed: false,
        };
        #[cfg(feature = "log")]
        log::trace!(
            "[Reserve] module [{}]: {:?} base 0x{:04x}, {} bytes, align {}",
            header.name(),
            class,
            base,
            len,
            align
        );
        if let Err(err) = self.populate(arena, &segments, image) {
            arena.free(base, len)?;
            return Err(err);
        }
        Ok(segments)
    }

    fn populate<A: Arena>(
        &self,
        arena: &mut A,
        segments: &ModuleSegments,
        image: &[u8],
    ) -> Result<()> {
        arena.write(FarPtr::new(segments.base, 0), image)?;
        let slack = image.len()..segments.total_bytes();
        if !slack.is_empty() {
            arena.fill(
                FarPtr::new(segments.base, image.len() as u16),
                slack.len(),
                0,
            )?;
        }
        Ok(())
    }

    /// Hands the cold region back to the arena.
    ///
    /// Returns the number of bytes freed, exactly `cold_size_para * 16`.
    /// Calling it twice is an error.
    pub fn reclaim_cold_region<A: Arena>(
        &self,
        arena: &mut A,
        segments: &mut ModuleSegments,
    ) -> Result<usize> {
        if segments.cold_reclaimed {
            return Err(state_error("cold region already reclaimed"));
        }
        let freed = para_to_bytes(segments.cold_para);
        if freed > 0 {
            arena.free(segments.base + segments.resident_para, freed)?;
        }
        segments.cold_reclaimed = true;
        #[cfg(feature = "log")]
        log::trace!(
            "[Reclaim] base 0x{:04x}: {} cold bytes returned",
            segments.base,
            freed
        );
        Ok(freed)
    }

    /// Releases everything the reservation still holds.
    pub fn release<A: Arena>(&self, arena: &mut A, segments: ModuleSegments) -> Result<()> {
        if segments.cold_reclaimed && segments.cold_para > 0 {
            let head = para_to_bytes(segments.resident_para);
            let tail_start = segments.resident_para + segments.cold_para;
            let tail = para_to_bytes(segments.total_para - tail_start);
            arena.free(segments.base, head)?;
            if tail > 0 {
                arena.free(segments.base + tail_start, tail)?;
            }
        } else {
            arena.free(segments.base, segments.total_bytes())?;
        }
        #[cfg(feature = "log")]
        log::trace!("[Release] base 0x{:04x}", segments.base);
        Ok(())
    }
}
