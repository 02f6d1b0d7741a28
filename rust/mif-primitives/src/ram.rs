//! Block allocator over the shared RAM that follows the firmware image.
//!
//! The arena is split into fixed 64-byte blocks. Each block carries a status
//! tag; the last block of every allocation is tagged `Bound` so that `free`
//! can recover the run length from the offset alone.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::mifram::MifRamRef;

/// Allocation granularity in bytes.
pub const RAM_BLOCK_SIZE: u32 = 64;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Free = 0,
    InUse = 1,
    /// Last block of an allocation.
    Bound = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamFreeError {
    /// The offset does not start a live allocation.
    NotAllocated(MifRamRef),
    /// An allocation runs off the end of the arena without a `Bound` block.
    Corrupt(MifRamRef),
}

impl fmt::Display for RamFreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RamFreeError::NotAllocated(r) => write!(f, "{r} is not the start of an allocation"),
            RamFreeError::Corrupt(r) => write!(f, "allocation at {r} has no end marker"),
        }
    }
}

impl core::error::Error for RamFreeError {}

pub struct RamAllocator {
    base: MifRamRef,
    blocks: Vec<BlockStatus>,
    free_blocks: u32,
}

impl RamAllocator {
    /// Manage `[base, base + size)`. `base` is rounded up to a block boundary
    /// and any trailing partial block is dropped.
    pub fn new(base: MifRamRef, size: u32) -> Self {
        let aligned = base.get().next_multiple_of(RAM_BLOCK_SIZE);
        let lost = aligned - base.get();
        let count = size.saturating_sub(lost) / RAM_BLOCK_SIZE;
        Self {
            base: MifRamRef::new(aligned),
            blocks: vec![BlockStatus::Free; count as usize],
            free_blocks: count,
        }
    }

    #[inline]
    pub fn base(&self) -> MifRamRef {
        self.base
    }

    #[inline]
    pub fn total_blocks(&self) -> u32 {
        self.blocks.len() as u32
    }

    #[inline]
    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    pub fn status(&self, index: u32) -> Option<BlockStatus> {
        self.blocks.get(index as usize).copied()
    }

    fn offset_of(&self, index: usize) -> u32 {
        self.base.get() + index as u32 * RAM_BLOCK_SIZE
    }

    /// First-fit allocation of `bytes`, starting at an offset aligned to
    /// `align` (a power of two; 0 means no constraint).
    pub fn alloc(&mut self, bytes: u32, align: u32) -> Option<MifRamRef> {
        if bytes == 0 {
            return None;
        }
        let align = align.max(1);
        if !align.is_power_of_two() {
            return None;
        }
        let needed = bytes.div_ceil(RAM_BLOCK_SIZE) as usize;
        if needed > self.free_blocks as usize {
            return None;
        }

        let mut start = 0;
        while start + needed <= self.blocks.len() {
            if !MifRamRef::new(self.offset_of(start)).is_aligned(align) {
                start += 1;
                continue;
            }
            match self.blocks[start..start + needed]
                .iter()
                .rposition(|b| *b != BlockStatus::Free)
            {
                Some(busy) => start += busy + 1,
                None => {
                    self.blocks[start..start + needed - 1].fill(BlockStatus::InUse);
                    self.blocks[start + needed - 1] = BlockStatus::Bound;
                    self.free_blocks -= needed as u32;
                    return Some(MifRamRef::new(self.offset_of(start)));
                }
            }
        }
        None
    }

    /// Release the allocation starting at `r`. Returns the number of blocks freed.
    pub fn free(&mut self, r: MifRamRef) -> Result<u32, RamFreeError> {
        let rel = r
            .get()
            .checked_sub(self.base.get())
            .filter(|rel| rel % RAM_BLOCK_SIZE == 0)
            .ok_or(RamFreeError::NotAllocated(r))?;
        let first = (rel / RAM_BLOCK_SIZE) as usize;

        match self.blocks.get(first) {
            Some(BlockStatus::InUse | BlockStatus::Bound) => {}
            _ => return Err(RamFreeError::NotAllocated(r)),
        }
        if first > 0 && self.blocks[first - 1] == BlockStatus::InUse {
            return Err(RamFreeError::NotAllocated(r));
        }

        let Some(len) = self.blocks[first..]
            .iter()
            .position(|b| *b != BlockStatus::InUse)
            .filter(|&end| self.blocks[first + end] == BlockStatus::Bound)
            .map(|end| end + 1)
        else {
            return Err(RamFreeError::Corrupt(r));
        };

        self.blocks[first..first + len].fill(BlockStatus::Free);
        self.free_blocks += len as u32;
        Ok(len as u32)
    }
}

impl fmt::Debug for RamAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RamAllocator")
            .field("base", &self.base)
            .field("total_blocks", &self.total_blocks())
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_rounds_up_to_block() {
        let ram = RamAllocator::new(MifRamRef::new(10), 64 * 4);
        assert_eq!(ram.base(), MifRamRef::new(64));
        assert_eq!(ram.total_blocks(), 3);
    }

    #[test]
    fn bound_marks_last_block() {
        let mut ram = RamAllocator::new(MifRamRef::new(0), 64 * 8);
        let a = ram.alloc(130, 4).unwrap();
        assert_eq!(a, MifRamRef::new(0));
        assert_eq!(ram.status(0), Some(BlockStatus::InUse));
        assert_eq!(ram.status(1), Some(BlockStatus::InUse));
        assert_eq!(ram.status(2), Some(BlockStatus::Bound));
        assert_eq!(ram.status(3), Some(BlockStatus::Free));

        let b = ram.alloc(1, 4).unwrap();
        assert_eq!(b, MifRamRef::new(192));
        assert_eq!(ram.status(3), Some(BlockStatus::Bound));

        assert_eq!(ram.free(a), Ok(3));
        assert_eq!(ram.free_blocks(), 7);
        assert_eq!(ram.free(b), Ok(1));
        assert_eq!(ram.free_blocks(), 8);
    }

    #[test]
    fn alignment_skips_unaligned_runs() {
        let mut ram = RamAllocator::new(MifRamRef::new(0), 64 * 16);
        ram.alloc(64, 1).unwrap();
        let aligned = ram.alloc(64, 256).unwrap();
        assert_eq!(aligned, MifRamRef::new(256));
        // The gap before it is still usable.
        assert_eq!(ram.alloc(128, 1), Some(MifRamRef::new(64)));
        assert_eq!(ram.alloc(64, 3), None);
    }

    #[test]
    fn free_rejects_interior_and_unknown_offsets() {
        let mut ram = RamAllocator::new(MifRamRef::new(0), 64 * 8);
        let a = ram.alloc(64 * 3, 1).unwrap();
        assert_eq!(
            ram.free(MifRamRef::new(64)),
            Err(RamFreeError::NotAllocated(MifRamRef::new(64)))
        );
        assert_eq!(
            ram.free(MifRamRef::new(65)),
            Err(RamFreeError::NotAllocated(MifRamRef::new(65)))
        );
        assert_eq!(
            ram.free(MifRamRef::new(64 * 5)),
            Err(RamFreeError::NotAllocated(MifRamRef::new(64 * 5)))
        );
        assert_eq!(ram.free(a), Ok(3));
        assert_eq!(ram.free(a), Err(RamFreeError::NotAllocated(a)));
    }

    #[test]
    fn exhaustion_has_no_side_effects() {
        let mut ram = RamAllocator::new(MifRamRef::new(0), 64 * 4);
        ram.alloc(64 * 3, 1).unwrap();
        assert_eq!(ram.alloc(128, 1), None);
        assert_eq!(ram.free_blocks(), 1);
        assert!(ram.alloc(64, 1).is_some());
        assert_eq!(ram.alloc(0, 1), None);
    }
}
