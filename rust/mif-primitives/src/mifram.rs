//! Offsets into the shared region.
//!
//! The coprocessor never sees host pointers. Everything advertised to it
//! (ring buffers, index words, the configuration record) is expressed as a
//! byte offset from the start of the shared region. [`MifRamRef`] is that
//! offset; converting it to or from a host pointer goes through
//! [`Region::ptr_of`](crate::Region::ptr_of) and
//! [`Region::ref_of`](crate::Region::ref_of), both bounds-checked.

use core::fmt;

/// Byte offset from the base of the shared region.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MifRamRef(u32);

impl MifRamRef {
    /// Wrap a raw offset. Validity is only established against a region.
    #[inline]
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    /// The raw offset as written into shared memory.
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Offset `delta` bytes further into the region.
    #[inline]
    pub fn checked_add(self, delta: u32) -> Option<Self> {
        self.0.checked_add(delta).map(Self)
    }

    /// Returns true if the offset is a multiple of `align` (a power of two).
    #[inline]
    pub const fn is_aligned(self, align: u32) -> bool {
        align != 0 && self.0 & (align - 1) == 0
    }
}

impl fmt::Display for MifRamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mif+{:#x}", self.0)
    }
}

impl From<MifRamRef> for u32 {
    fn from(r: MifRamRef) -> u32 {
        r.0
    }
}

/// Failure to translate between host pointers and shared-region offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefError {
    /// `[offset, offset + len)` does not lie inside the region.
    OutOfBounds {
        offset: usize,
        len: usize,
        region_len: usize,
    },
    /// The offset is not aligned for the value stored there.
    Misaligned { offset: usize, align: usize },
    /// The offset does not fit the 32-bit wire representation.
    TooLarge(usize),
}

impl fmt::Display for RefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefError::OutOfBounds {
                offset,
                len,
                region_len,
            } => write!(
                f,
                "range {offset:#x}+{len} outside shared region of {region_len} bytes"
            ),
            RefError::Misaligned { offset, align } => {
                write!(f, "offset {offset:#x} not aligned to {align}")
            }
            RefError::TooLarge(offset) => write!(f, "offset {offset:#x} does not fit in 32 bits"),
        }
    }
}

impl core::error::Error for RefError {}
