use super::{Arena, MemoryClass};
use crate::{
    Error, Result,
    addr::{FarPtr, PARAGRAPH, Selector, bytes_to_para},
    error::custom_error,
};
use alloc::{vec, vec::Vec};
use core::ops::Range;

/// Location and size of one memory pool, in paragraphs.
#[derive(Clone, Copy, Debug)]
pub struct PoolSpec {
    pub start: Selector,
    pub paragraphs: u32,
}

impl PoolSpec {
    pub const fn new(start: Selector, paragraphs: u32) -> Self {
        Self { start, paragraphs }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    start: u32,
    len: u32,
}

impl Span {
    #[inline]
    fn end(&self) -> u32 {
        self.start + self.len
    }
}

struct Pool {
    class: MemoryClass,
    start: u32,
    paragraphs: u32,
    memory: Vec<u8>,
    /// Free spans, sorted by start and never adjacent.
    free: Vec<Span>,
    used: u32,
}

impl Pool {
    fn new(class: MemoryClass, spec: PoolSpec) -> Self {
        let start = spec.start as u32;
        // selectors are 16 bits wide
        let paragraphs = spec.paragraphs.min(0x1_0000 - start);
        Self {
            class,
            start,
            paragraphs,
            memory: vec![0; paragraphs as usize * PARAGRAPH],
            free: if paragraphs > 0 {
                vec![Span {
                    start,
                    len: paragraphs,
                }]
            } else {
                Vec::new()
            },
            used: 0,
        }
    }

    #[inline]
    fn end(&self) -> u32 {
        self.start + self.paragraphs
    }

    fn contains_linear(&self, range: &Range<usize>) -> bool {
        let lo = self.start as usize * PARAGRAPH;
        let hi = self.end() as usize * PARAGRAPH;
        range.start >= lo && range.end <= hi
    }

    fn local(&self, range: Range<usize>) -> Range<usize> {
        let lo = self.start as usize * PARAGRAPH;
        range.start - lo..range.end - lo
    }

    fn allocate(&mut self, paras: u32, align: u32) -> Option<u32> {
        let (idx, at) = self.free.iter().enumerate().find_map(|(idx, span)| {
            let at = span.start.next_multiple_of(align);
            (at + paras <= span.end()).then_some((idx, at))
        })?;
        let span = self.free.remove(idx);
        let tail = Span {
            start: at + paras,
            len: span.end() - (at + paras),
        };
        let head = Span {
            start: span.start,
            len: at - span.start,
        };
        if tail.len > 0 {
            self.free.insert(idx, tail);
        }
        if head.len > 0 {
            self.free.insert(idx, head);
        }
        self.used += paras;
        Some(at)
    }

    fn free(&mut self, start: u32, paras: u32) -> Result<()> {
        let end = start + paras;
        if start < self.start || end > self.end() {
            return Err(custom_error("free outside of pool"));
        }
        let idx = self.free.partition_point(|span| span.start < start);
        let overlaps_prev = idx > 0 && self.free[idx - 1].end() > start;
        let overlaps_next = idx < self.free.len() && self.free[idx].start < end;
        if overlaps_prev || overlaps_next {
            return Err(custom_error("free of memory that is not allocated"));
        }
        self.free.insert(idx, Span { start, len: paras });
        // coalesce with the following span, then the preceding one
        if idx + 1 < self.free.len() && self.free[idx].end() == self.free[idx + 1].start {
            let next = self.free.remove(idx + 1);
            self.free[idx].len += next.len;
        }
        if idx > 0 && self.free[idx - 1].end() == self.free[idx].start {
            let cur = self.free.remove(idx);
            self.free[idx - 1].len += cur.len;
        }
        self.used -= paras;
        let local = self.local(start as usize * PARAGRAPH..end as usize * PARAGRAPH);
        self.memory[local].fill(0);
        Ok(())
    }
}

/// Paragraph-granular first-fit arena.
///
/// The default layout mirrors a DOS machine: conventional memory from
/// selector `0x1000` up to the video area, and an upper-memory pool at
/// `0xC800`. Freed memory is scrubbed, so nothing read from a released range
/// can look like a stale module image.
pub struct ParagraphArena {
    pools: Vec<Pool>,
}

impl Default for ParagraphArena {
    fn default() -> Self {
        Self::new(
            PoolSpec::new(0x1000, 0x9000),
            Some(PoolSpec::new(0xC800, 0x2800)),
        )
    }
}

impl ParagraphArena {
    /// Creates an arena with a conventional pool and an optional upper pool.
    pub fn new(conventional: PoolSpec, upper: Option<PoolSpec>) -> Self {
        let mut pools = vec![Pool::new(MemoryClass::Conventional, conventional)];
        if let Some(upper) = upper {
            pools.push(Pool::new(MemoryClass::Upper, upper));
        }
        Self { pools }
    }

    /// Number of free bytes left in `class`.
    pub fn free_bytes(&self, class: MemoryClass) -> usize {
        self.pools
            .iter()
            .filter(|pool| pool.class == class)
            .map(|pool| (pool.paragraphs - pool.used) as usize * PARAGRAPH)
            .sum()
    }

    fn pool_of(&self, range: &Range<usize>) -> Result<&Pool> {
        self.pools
            .iter()
            .find(|pool| pool.contains_linear(range))
            .ok_or_else(|| out_of_range(range))
    }

    fn pool_of_mut(&mut self, range: &Range<usize>) -> Result<&mut Pool> {
        self.pools
            .iter_mut()
            .find(|pool| pool.contains_linear(range))
            .ok_or_else(|| out_of_range(range))
    }
}

#[cold]
fn out_of_range(range: &Range<usize>) -> Error {
    custom_error(alloc::format!(
        "linear range 0x{:x}..0x{:x} is outside the arena",
        range.start,
        range.end
    ))
}

#[inline]
fn linear_range(addr: FarPtr, len: usize) -> Range<usize> {
    let start = addr.linear() as usize;
    start..start + len
}

impl Arena for ParagraphArena {
    fn allocate(&mut self, len: usize, align: usize, class: MemoryClass) -> Result<Selector> {
        let paras = bytes_to_para(len) as u32;
        let align = bytes_to_para(align).max(1) as u32;
        let fail = Error::AllocationFailed {
            paragraphs: paras,
            class,
        };
        if paras == 0 {
            return Err(fail);
        }
        let Some(start) = self
            .pools
            .iter_mut()
            .filter(|pool| pool.class == class)
            .find_map(|pool| pool.allocate(paras, align))
        else {
            return Err(fail);
        };
        #[cfg(feature = "log")]
        log::trace!(
            "[Arena] allocate {:?}: selector 0x{:04x}, paragraphs {}",
            class,
            start,
            paras
        );
        Ok(start as Selector)
    }

    fn free(&mut self, base: Selector, len: usize) -> Result<()> {
        let paras = bytes_to_para(len) as u32;
        let start = base as u32;
        let pool = self
            .pools
            .iter_mut()
            .find(|pool| start >= pool.start && start < pool.end())
            .ok_or_else(|| custom_error("free of a selector outside the arena"))?;
        pool.free(start, paras)?;
        #[cfg(feature = "log")]
        log::trace!("[Arena] free selector 0x{:04x}, paragraphs {}", base, paras);
        Ok(())
    }

    fn read(&self, addr: FarPtr, buf: &mut [u8]) -> Result<()> {
        let range = linear_range(addr, buf.len());
        let pool = self.pool_of(&range)?;
        buf.copy_from_slice(&pool.memory[pool.local(range)]);
        Ok(())
    }

    fn write(&mut self, addr: FarPtr, data: &[u8]) -> Result<()> {
        let range = linear_range(addr, data.len());
        let pool = self.pool_of_mut(&range)?;
        let local = pool.local(range);
        pool.memory[local].copy_from_slice(data);
        Ok(())
    }

    fn fill(&mut self, addr: FarPtr, len: usize, byte: u8) -> Result<()> {
        let range = linear_range(addr, len);
        let pool = self.pool_of_mut(&range)?;
        let local = pool.local(range);
        pool.memory[local].fill(byte);
        Ok(())
    }

    fn used_bytes(&self) -> usize {
        self.pools
            .iter()
            .map(|pool| pool.used as usize * PARAGRAPH)
            .sum()
    }

    fn capacity(&self, class: MemoryClass) -> usize {
        self.pools
            .iter()
            .filter(|pool| pool.class == class)
            .map(|pool| pool.paragraphs as usize * PARAGRAPH)
            .sum()
    }
}
