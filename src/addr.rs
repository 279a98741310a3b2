//! Two-part segmented addresses.
//!
//! Every address the loader hands out is a `(selector, offset)` pair. The only
//! place the pair is collapsed into a single number is [`FarPtr::linear`], so a
//! flat-memory target can substitute its own base for the selector.

use core::fmt::{Debug, Display};

/// Size of a paragraph, the allocation and alignment unit of the format.
pub const PARAGRAPH: usize = 16;

/// Bank/segment component of an address.
pub type Selector = u16;

/// Converts a paragraph count to bytes.
#[inline]
pub const fn para_to_bytes(paragraphs: u16) -> usize {
    paragraphs as usize * PARAGRAPH
}

/// Converts a byte count to paragraphs, rounding up.
#[inline]
pub const fn bytes_to_para(bytes: usize) -> usize {
    bytes.div_ceil(PARAGRAPH)
}

/// A `selector:offset` address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FarPtr {
    pub selector: Selector,
    pub offset: u16,
}

impl FarPtr {
    #[inline]
    pub const fn new(selector: Selector, offset: u16) -> Self {
        Self { selector, offset }
    }

    /// The linear (physical) address `selector * 16 + offset`.
    #[inline]
    pub const fn linear(self) -> u32 {
        self.selector as u32 * PARAGRAPH as u32 + self.offset as u32
    }

    /// Encodes the pointer the way it is stored in memory: offset word first,
    /// then the selector word.
    #[inline]
    pub const fn to_le_bytes(self) -> [u8; 4] {
        let o = self.offset.to_le_bytes();
        let s = self.selector.to_le_bytes();
        [o[0], o[1], s[0], s[1]]
    }

    #[inline]
    pub const fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self {
            offset: u16::from_le_bytes([bytes[0], bytes[1]]),
            selector: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    /// Returns the pointer advanced by `delta` bytes within the same selector.
    #[inline]
    pub fn checked_add(self, delta: u16) -> Option<Self> {
        self.offset.checked_add(delta).map(|offset| Self {
            selector: self.selector,
            offset,
        })
    }
}

impl Display for FarPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04X}:{:04X}", self.selector, self.offset)
    }
}

impl Debug for FarPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        Display::fmt(self, f)
    }
}
