use std::sync::Arc;

use mif_primitives::{BITMAP_MAX_ENTRIES, BitmapAllocator};
use parking_lot::Mutex;

use crate::error::MxError;
use crate::hal::MifHal;

/// Mailboxes 0..4 carry the boot handshake.
pub const MBOX_RESERVED: u32 = 4;

pub const MBOX_ENTRY_POINT: u32 = 0;
pub const MBOX_MXCONF: u32 = 1;
pub const MBOX_MAGIC: u32 = 2;
pub const MBOX_STARTUP_FLAGS: u32 = 3;

/// Hands out runs of mailbox registers above the reserved handshake set.
pub struct MboxMan {
    hal: Arc<dyn MifHal>,
    bitmap: Mutex<BitmapAllocator>,
}

impl MboxMan {
    pub fn new(hal: Arc<dyn MifHal>) -> Self {
        let count = hal.mailbox_count().min(BITMAP_MAX_ENTRIES);
        let mut bitmap = BitmapAllocator::new(count);
        for index in 0..MBOX_RESERVED.min(count) {
            bitmap.reserve(index);
        }
        Self {
            hal,
            bitmap: Mutex::new(bitmap),
        }
    }

    /// Claim `n` consecutive mailboxes and return the first index.
    pub fn alloc_mboxes(&self, n: u32) -> Result<u32, MxError> {
        self.bitmap
            .lock()
            .alloc_n(n)
            .map_err(|_| MxError::ResourceExhausted("mailboxes"))
    }

    pub fn free_mboxes(&self, first: u32, n: u32) {
        if first < MBOX_RESERVED {
            return;
        }
        self.bitmap.lock().free_n(first, n);
    }

    pub fn write(&self, index: u32, value: u32) {
        self.hal.mailbox_write(index, value);
    }

    pub fn read(&self, index: u32) -> u32 {
        self.hal.mailbox_read(index)
    }

    pub fn capacity(&self) -> u32 {
        self.bitmap.lock().capacity()
    }
}
