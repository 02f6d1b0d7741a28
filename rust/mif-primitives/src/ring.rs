use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use crate::mifram::{MifRamRef, RefError};
use crate::region::Region;

/// Where a ring lives inside the shared region.
///
/// The data area is `slot_count * slot_size` bytes starting at `buffer`. The
/// two index words live at their own offsets; each side only ever stores to
/// its own index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub buffer: MifRamRef,
    pub slot_count: u32,
    pub slot_size: u32,
    pub read_index: MifRamRef,
    pub write_index: MifRamRef,
}

impl RingLayout {
    /// Size of the data area in bytes.
    pub fn data_len(&self) -> Option<u32> {
        self.slot_count.checked_mul(self.slot_size)
    }
}

/// Failure to place a ring in a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Fewer than two slots, or zero-sized slots.
    Geometry { slot_count: u32, slot_size: u32 },
    /// Buffer or index words fall outside the region.
    Ref(RefError),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::Geometry {
                slot_count,
                slot_size,
            } => write!(f, "invalid ring geometry: {slot_count} slots of {slot_size} bytes"),
            RingError::Ref(e) => write!(f, "ring placement: {e}"),
        }
    }
}

impl core::error::Error for RingError {}

impl From<RefError> for RingError {
    fn from(e: RefError) -> Self {
        RingError::Ref(e)
    }
}

/// Snapshot of both indices, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    pub read_index: u32,
    pub write_index: u32,
    pub used: u32,
    pub free: u32,
}

/// A slot handed out by [`PacketRing::peek`] without consuming it.
#[derive(Debug, Clone, Copy)]
pub struct PeekedSlot<'a> {
    index: u32,
    data: &'a [u8],
}

impl<'a> PeekedSlot<'a> {
    /// Slot index, to pass back to `peek` or `peek_complete`.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The full slot contents.
    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Fixed-slot circular packet buffer in shared memory.
///
/// One slot is always kept empty so that `read == write` means empty.
/// Writes move whole slots; a short final slot is zero-filled.
pub struct PacketRing {
    region: Region,
    layout: RingLayout,
    data_len: usize,
}

unsafe impl Send for PacketRing {}
unsafe impl Sync for PacketRing {}

impl PacketRing {
    /// Place a new ring and zero both indices.
    ///
    /// # Safety
    ///
    /// Nobody else may use the ring's memory until this returns.
    pub unsafe fn init(region: Region, layout: RingLayout) -> Result<Self, RingError> {
        let ring = unsafe { Self::attach(region, layout)? };
        ring.read_word().store(0, Ordering::Relaxed);
        ring.write_word().store(0, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        Ok(ring)
    }

    /// Attach to a ring another party already initialised.
    ///
    /// # Safety
    ///
    /// The memory described by `layout` must stay reserved for this ring
    /// while the returned value (or the other party's view) is in use.
    pub unsafe fn attach(region: Region, layout: RingLayout) -> Result<Self, RingError> {
        if layout.slot_count < 2 || layout.slot_size == 0 {
            return Err(RingError::Geometry {
                slot_count: layout.slot_count,
                slot_size: layout.slot_size,
            });
        }
        let data_len = layout.data_len().ok_or(RingError::Geometry {
            slot_count: layout.slot_count,
            slot_size: layout.slot_size,
        })? as usize;
        region.check(layout.buffer, data_len)?;
        region.atomic_u32(layout.read_index)?;
        region.atomic_u32(layout.write_index)?;
        Ok(Self {
            region,
            layout,
            data_len,
        })
    }

    #[inline]
    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.layout.slot_count
    }

    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.layout.slot_size
    }

    #[inline]
    fn read_word(&self) -> &AtomicU32 {
        // Checked in `attach`.
        unsafe { &*(self.region.as_ptr().add(self.layout.read_index.as_usize()) as *const AtomicU32) }
    }

    #[inline]
    fn write_word(&self) -> &AtomicU32 {
        unsafe {
            &*(self.region.as_ptr().add(self.layout.write_index.as_usize()) as *const AtomicU32)
        }
    }

    #[inline]
    fn data_ptr(&self) -> *mut u8 {
        unsafe { self.region.as_ptr().add(self.layout.buffer.as_usize()) }
    }

    /// Indices written by the other side may be garbage; keep them in range.
    #[inline]
    fn load_index(&self, word: &AtomicU32, order: Ordering) -> u32 {
        word.load(order) % self.layout.slot_count
    }

    #[inline]
    fn store_index(&self, word: &AtomicU32, value: u32) {
        word.store(value, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    #[inline]
    fn indices(&self) -> (u32, u32) {
        let r = self.load_index(self.read_word(), Ordering::Acquire);
        let w = self.load_index(self.write_word(), Ordering::Acquire);
        (r, w)
    }

    fn free_between(&self, r: u32, w: u32) -> u32 {
        if r > w {
            r - w - 1
        } else {
            self.layout.slot_count - (w - r) - 1
        }
    }

    fn used_between(&self, r: u32, w: u32) -> u32 {
        (w + self.layout.slot_count - r) % self.layout.slot_count
    }

    /// Slots a writer could fill right now.
    pub fn free_space(&self) -> u32 {
        let (r, w) = self.indices();
        self.free_between(r, w)
    }

    /// Slots written but not yet consumed.
    pub fn used_space(&self) -> u32 {
        let (r, w) = self.indices();
        self.used_between(r, w)
    }

    pub fn status(&self) -> RingStatus {
        let (r, w) = self.indices();
        RingStatus {
            read_index: r,
            write_index: w,
            used: self.used_between(r, w),
            free: self.free_between(r, w),
        }
    }

    /// Copy `src` in at byte position `pos`, wrapping at the end of the data area.
    fn copy_in(&self, pos: usize, src: &[u8]) -> usize {
        let first = src.len().min(self.data_len - pos);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.data_ptr().add(pos), first);
            if first < src.len() {
                ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data_ptr(), src.len() - first);
            }
        }
        (pos + src.len()) % self.data_len
    }

    fn zero_in(&self, pos: usize, len: usize) {
        let first = len.min(self.data_len - pos);
        unsafe {
            ptr::write_bytes(self.data_ptr().add(pos), 0, first);
            if first < len {
                ptr::write_bytes(self.data_ptr(), 0, len - first);
            }
        }
    }

    fn copy_out(&self, pos: usize, dst: &mut [u8]) {
        let first = dst.len().min(self.data_len - pos);
        unsafe {
            ptr::copy_nonoverlapping(self.data_ptr().add(pos), dst.as_mut_ptr(), first);
            if first < dst.len() {
                ptr::copy_nonoverlapping(
                    self.data_ptr(),
                    dst.as_mut_ptr().add(first),
                    dst.len() - first,
                );
            }
        }
    }

    /// Write `bytes` as a run of whole slots.
    ///
    /// Returns false, leaving the ring untouched, when there is not enough
    /// free space.
    pub fn write(&self, bytes: &[u8]) -> bool {
        self.write_gather(&[bytes])
    }

    /// Write several buffers as one contiguous packet stream.
    ///
    /// The result is byte-identical to `write` of the concatenation: a slot
    /// left partially filled by one part is completed by the next.
    pub fn write_gather(&self, parts: &[&[u8]]) -> bool {
        let slot_size = self.layout.slot_size as usize;
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let slots = total.div_ceil(slot_size);
        if slots == 0 {
            return true;
        }

        let (r, w) = self.indices();
        if slots > self.free_between(r, w) as usize {
            return false;
        }

        let mut pos = w as usize * slot_size;
        for part in parts {
            pos = self.copy_in(pos, part);
        }
        let pad = slots * slot_size - total;
        if pad > 0 {
            self.zero_in(pos, pad);
        }

        let next = (w + slots as u32) % self.layout.slot_count;
        self.store_index(self.write_word(), next);
        true
    }

    /// Read up to `buf.len()` bytes worth of slots.
    ///
    /// Fewer slots than requested are returned when fewer are available. A
    /// slot is consumed as a whole even if `buf` ends inside it.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let slot_size = self.layout.slot_size as usize;
        let (r, w) = self.indices();
        let available = self.used_between(r, w) as usize;
        let slots = buf.len().div_ceil(slot_size).min(available);
        if slots == 0 {
            return 0;
        }
        let bytes = buf.len().min(slots * slot_size);
        self.copy_out(r as usize * slot_size, &mut buf[..bytes]);

        let next = (r + slots as u32) % self.layout.slot_count;
        self.store_index(self.read_word(), next);
        bytes
    }

    /// Look at the next unconsumed slot without consuming it.
    ///
    /// With `after = None` this returns the oldest slot; passing the index of
    /// a previously peeked slot returns the one following it.
    pub fn peek(&self, after: Option<u32>) -> Option<PeekedSlot<'_>> {
        let (r, w) = self.indices();
        let next = match after {
            None => r,
            Some(i) => (i + 1) % self.layout.slot_count,
        };
        if self.used_between(r, next) >= self.used_between(r, w) {
            return None;
        }
        let slot_size = self.layout.slot_size as usize;
        let data = unsafe {
            core::slice::from_raw_parts(self.data_ptr().add(next as usize * slot_size), slot_size)
        };
        Some(PeekedSlot { index: next, data })
    }

    /// Consume every slot up to and including `last`.
    ///
    /// Returns false if `last` is not an unconsumed slot.
    pub fn peek_complete(&self, last: u32) -> bool {
        let (r, w) = self.indices();
        if last >= self.layout.slot_count || self.used_between(r, last) >= self.used_between(r, w)
        {
            return false;
        }
        self.store_index(self.read_word(), (last + 1) % self.layout.slot_count);
        true
    }
}

impl fmt::Debug for PacketRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketRing")
            .field("layout", &self.layout)
            .field("status", &self.status())
            .finish()
    }
}
