use core::fmt;

/// Largest bitmap a [`BitmapAllocator`] can track.
pub const BITMAP_MAX_ENTRIES: u32 = 64;

/// No run of free entries long enough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted {
    pub requested: u32,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no run of {} free entries", self.requested)
    }
}

impl core::error::Error for Exhausted {}

/// First-fit allocator for contiguous runs of small indices: interrupt
/// bits and mailbox registers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BitmapAllocator {
    used: u64,
    size: u32,
}

impl BitmapAllocator {
    /// # Panics
    ///
    /// Panics if `size` exceeds [`BITMAP_MAX_ENTRIES`].
    pub const fn new(size: u32) -> Self {
        assert!(size <= BITMAP_MAX_ENTRIES, "bitmap too large");
        Self { used: 0, size }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn used_count(&self) -> u32 {
        self.used.count_ones()
    }

    #[inline]
    pub fn is_set(&self, index: u32) -> bool {
        index < self.size && self.used & (1 << index) != 0
    }

    fn run_mask(first: u32, n: u32) -> u64 {
        if n >= 64 {
            u64::MAX << first
        } else {
            ((1u64 << n) - 1) << first
        }
    }

    /// Claim `n` contiguous entries and return the first index.
    pub fn alloc_n(&mut self, n: u32) -> Result<u32, Exhausted> {
        if n == 0 || n > self.size {
            return Err(Exhausted { requested: n });
        }
        for first in 0..=(self.size - n) {
            let mask = Self::run_mask(first, n);
            if self.used & mask == 0 {
                self.used |= mask;
                return Ok(first);
            }
        }
        Err(Exhausted { requested: n })
    }

    #[inline]
    pub fn alloc(&mut self) -> Result<u32, Exhausted> {
        self.alloc_n(1)
    }

    /// Clear `[first, first + n)`, whether or not it was allocated.
    pub fn free_n(&mut self, first: u32, n: u32) {
        if first >= self.size || n == 0 {
            return;
        }
        let n = n.min(self.size - first);
        self.used &= !Self::run_mask(first, n);
    }

    #[inline]
    pub fn free(&mut self, index: u32) {
        self.free_n(index, 1);
    }

    /// Mark `index` in use without allocating. Used for entries with a fixed
    /// meaning, set up before any dynamic allocation.
    pub fn reserve(&mut self, index: u32) {
        if index < self.size {
            self.used |= 1 << index;
        }
    }
}

impl fmt::Debug for BitmapAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitmapAllocator({:#0w$b}/{})", self.used, self.size, w = self.size as usize + 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_runs() {
        let mut bm = BitmapAllocator::new(8);
        assert_eq!(bm.alloc_n(3), Ok(0));
        assert_eq!(bm.alloc_n(2), Ok(3));
        bm.free_n(0, 3);
        // Bits 3 and 4 still split the map; no room for four in a row.
        assert_eq!(bm.alloc_n(4), Err(Exhausted { requested: 4 }));
        assert_eq!(bm.alloc_n(3), Ok(0));
        assert_eq!(bm.alloc_n(3), Ok(5));
    }

    #[test]
    fn reserve_blocks_allocation() {
        let mut bm = BitmapAllocator::new(4);
        bm.reserve(0);
        assert_eq!(bm.alloc(), Ok(1));
        assert_eq!(bm.alloc_n(2), Ok(2));
        assert_eq!(bm.alloc(), Err(Exhausted { requested: 1 }));
        assert_eq!(bm.used_count(), 4);
    }

    #[test]
    fn full_width_bitmap() {
        let mut bm = BitmapAllocator::new(64);
        assert_eq!(bm.alloc_n(64), Ok(0));
        assert!(bm.is_set(63));
        bm.free_n(0, 64);
        assert_eq!(bm.used_count(), 0);
        assert_eq!(bm.alloc_n(65), Err(Exhausted { requested: 65 }));
    }

    #[test]
    fn failure_leaves_bitmap_unchanged() {
        let mut bm = BitmapAllocator::new(4);
        bm.reserve(1);
        let before = bm;
        assert!(bm.alloc_n(3).is_err());
        assert_eq!(bm, before);
        assert_eq!(bm.alloc_n(2), Ok(2));
    }
}
