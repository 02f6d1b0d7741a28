//! Shared region plus the allocator over the RAM past the firmware image.

use mif_primitives::{MifRamRef, RamAllocator, Region};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::MxError;

pub struct SharedRegion {
    region: Region,
    ram: Mutex<RamAllocator>,
}

impl SharedRegion {
    /// Wrap `region`, managing everything from `alloc_start` to its end.
    pub fn new(region: Region, alloc_start: u32) -> Self {
        let len = u32::try_from(region.len()).unwrap_or(u32::MAX);
        let size = len.saturating_sub(alloc_start);
        Self {
            region,
            ram: Mutex::new(RamAllocator::new(MifRamRef::new(alloc_start), size)),
        }
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    pub fn alloc(&self, bytes: u32, align: u32) -> Result<MifRamRef, MxError> {
        let r = self
            .ram
            .lock()
            .alloc(bytes, align)
            .ok_or(MxError::ResourceExhausted("shared RAM"))?;
        trace!(%r, bytes, align, "mifram alloc");
        Ok(r)
    }

    /// Allocate and zero.
    pub fn alloc_zeroed(&self, bytes: u32, align: u32) -> Result<MifRamRef, MxError> {
        let r = self.alloc(bytes, align)?;
        self.region.fill(r, bytes as usize, 0)?;
        Ok(r)
    }

    pub fn free(&self, r: MifRamRef) -> Result<(), MxError> {
        let blocks = self.ram.lock().free(r)?;
        trace!(%r, blocks, "mifram free");
        Ok(())
    }

    pub fn ptr_of(&self, r: MifRamRef) -> Result<*mut u8, MxError> {
        Ok(self.region.ptr_of(r)?)
    }

    pub fn ref_of(&self, ptr: *const u8) -> Result<MifRamRef, MxError> {
        Ok(self.region.ref_of(ptr)?)
    }

    pub fn free_blocks(&self) -> u32 {
        self.ram.lock().free_blocks()
    }

    pub fn total_blocks(&self) -> u32 {
        self.ram.lock().total_blocks()
    }
}
