use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::AtomicU32;

use crate::mifram::{MifRamRef, RefError};

/// The shared region as seen by the host: a base pointer and a length.
///
/// # Safety
///
/// The caller must ensure:
/// - `base` is valid for `len` bytes and aligned for every type placed in it
/// - the memory stays mapped for as long as any copy of this `Region` is used
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Create a region from a mapped base pointer and its length.
    ///
    /// # Safety
    ///
    /// - `base` must be valid for reads and writes of `len` bytes
    /// - the mapping must outlive every use of the returned `Region`
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check that `[r, r + len)` lies inside the region.
    pub fn check(&self, r: MifRamRef, len: usize) -> Result<(), RefError> {
        let offset = r.as_usize();
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(RefError::OutOfBounds {
                offset,
                len,
                region_len: self.len,
            }),
        }
    }

    /// Translate a shared-region offset into a host pointer.
    pub fn ptr_of(&self, r: MifRamRef) -> Result<*mut u8, RefError> {
        self.check(r, 1)?;
        Ok(unsafe { self.as_ptr().add(r.as_usize()) })
    }

    /// Translate a host pointer into a shared-region offset.
    pub fn ref_of(&self, ptr: *const u8) -> Result<MifRamRef, RefError> {
        let base = self.as_ptr() as usize;
        let addr = ptr as usize;
        if addr < base || addr >= base + self.len {
            return Err(RefError::OutOfBounds {
                offset: addr.wrapping_sub(base),
                len: 1,
                region_len: self.len,
            });
        }
        let offset = addr - base;
        let offset = u32::try_from(offset).map_err(|_| RefError::TooLarge(offset))?;
        Ok(MifRamRef::new(offset))
    }

    /// Borrow a `u32` word in shared memory as an atomic.
    pub fn atomic_u32(&self, r: MifRamRef) -> Result<&AtomicU32, RefError> {
        self.check(r, size_of::<AtomicU32>())?;
        if !r.is_aligned(align_of::<AtomicU32>() as u32) {
            return Err(RefError::Misaligned {
                offset: r.as_usize(),
                align: align_of::<AtomicU32>(),
            });
        }
        Ok(unsafe { &*(self.as_ptr().add(r.as_usize()) as *const AtomicU32) })
    }

    /// Volatile read of a `u32` at `r`.
    pub fn read_u32(&self, r: MifRamRef) -> Result<u32, RefError> {
        self.check(r, 4)?;
        Ok(unsafe { ptr::read_volatile(self.as_ptr().add(r.as_usize()) as *const u32) })
    }

    /// Volatile write of a `u32` at `r`.
    pub fn write_u32(&self, r: MifRamRef, value: u32) -> Result<(), RefError> {
        self.check(r, 4)?;
        unsafe { ptr::write_volatile(self.as_ptr().add(r.as_usize()) as *mut u32, value) };
        Ok(())
    }

    /// Copy `src` into the region at `r`.
    pub fn write_bytes(&self, r: MifRamRef, src: &[u8]) -> Result<(), RefError> {
        self.check(r, src.len())?;
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(r.as_usize()), src.len())
        };
        Ok(())
    }

    /// Copy bytes at `r` out of the region into `dst`.
    pub fn read_bytes(&self, r: MifRamRef, dst: &mut [u8]) -> Result<(), RefError> {
        self.check(r, dst.len())?;
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr().add(r.as_usize()), dst.as_mut_ptr(), dst.len())
        };
        Ok(())
    }

    /// Set `len` bytes at `r` to `byte`.
    pub fn fill(&self, r: MifRamRef, len: usize, byte: u8) -> Result<(), RefError> {
        self.check(r, len)?;
        unsafe { ptr::write_bytes(self.as_ptr().add(r.as_usize()), byte, len) };
        Ok(())
    }

    /// Borrow `len` bytes at `r`.
    ///
    /// # Safety
    ///
    /// Nobody (host or coprocessor) may write the range while the slice lives.
    pub unsafe fn slice(&self, r: MifRamRef, len: usize) -> Result<&[u8], RefError> {
        self.check(r, len)?;
        Ok(unsafe { core::slice::from_raw_parts(self.as_ptr().add(r.as_usize()), len) })
    }

    /// Write a plain-old-data value at `r`.
    ///
    /// # Safety
    ///
    /// `T` must be `#[repr(C)]` with no padding-sensitive invariants and
    /// `r` must be aligned for `T`.
    pub unsafe fn write_value<T: Copy>(&self, r: MifRamRef, value: T) -> Result<(), RefError> {
        self.check(r, size_of::<T>())?;
        debug_assert!(r.is_aligned(align_of::<T>() as u32));
        unsafe { ptr::write_volatile(self.as_ptr().add(r.as_usize()) as *mut T, value) };
        Ok(())
    }

    /// Read a plain-old-data value at `r`.
    ///
    /// # Safety
    ///
    /// Every bit pattern must be a valid `T` and `r` must be aligned for `T`.
    pub unsafe fn read_value<T: Copy>(&self, r: MifRamRef) -> Result<T, RefError> {
        self.check(r, size_of::<T>())?;
        debug_assert!(r.is_aligned(align_of::<T>() as u32));
        Ok(unsafe { ptr::read_volatile(self.as_ptr().add(r.as_usize()) as *const T) })
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

#[cfg(any(test, feature = "alloc"))]
mod heap {
    use super::Region;
    use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
    use core::ptr::NonNull;

    /// Heap-backed stand-in for the shared mapping, used by the simulator.
    pub struct HeapRegion {
        base: NonNull<u8>,
        len: usize,
        layout: Layout,
    }

    impl HeapRegion {
        /// Allocate a zeroed region aligned to 4 KiB, like a page mapping.
        ///
        /// # Panics
        ///
        /// Panics if `size` cannot be described by a `Layout`.
        pub fn new_zeroed(size: usize) -> Self {
            let Ok(layout) = Layout::from_size_align(size.max(1), 4096) else {
                panic!("heap region of {size} bytes is not allocatable");
            };
            let ptr = unsafe { alloc_zeroed(layout) };
            let Some(base) = NonNull::new(ptr) else {
                handle_alloc_error(layout);
            };
            Self {
                base,
                len: size,
                layout,
            }
        }

        /// Returns a Region view of this allocation.
        #[inline]
        pub fn region(&self) -> Region {
            unsafe { Region::from_raw(self.base, self.len) }
        }

        #[inline]
        pub fn len(&self) -> usize {
            self.len
        }

        #[inline]
        pub fn is_empty(&self) -> bool {
            self.len == 0
        }
    }

    impl Drop for HeapRegion {
        fn drop(&mut self) {
            unsafe { dealloc(self.base.as_ptr(), self.layout) };
        }
    }

    unsafe impl Send for HeapRegion {}
    unsafe impl Sync for HeapRegion {}
}

#[cfg(any(test, feature = "alloc"))]
pub use heap::HeapRegion;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_offset_translation_is_bounds_checked() {
        let heap = HeapRegion::new_zeroed(1024);
        let region = heap.region();

        let ptr = region.ptr_of(MifRamRef::new(0x40)).unwrap();
        assert_eq!(region.ref_of(ptr).unwrap(), MifRamRef::new(0x40));

        assert!(matches!(
            region.ptr_of(MifRamRef::new(1024)),
            Err(RefError::OutOfBounds { .. })
        ));
        let outside = unsafe { region.as_ptr().add(2048) };
        assert!(region.ref_of(outside).is_err());
    }

    #[test]
    fn words_and_bytes() {
        let heap = HeapRegion::new_zeroed(256);
        let region = heap.region();

        region.write_u32(MifRamRef::new(8), 0xdead_beef).unwrap();
        assert_eq!(region.read_u32(MifRamRef::new(8)).unwrap(), 0xdead_beef);
        assert!(region.write_u32(MifRamRef::new(254), 1).is_err());

        region.write_bytes(MifRamRef::new(16), b"hello").unwrap();
        let mut out = [0u8; 5];
        region.read_bytes(MifRamRef::new(16), &mut out).unwrap();
        assert_eq!(&out, b"hello");

        assert!(matches!(
            region.atomic_u32(MifRamRef::new(6)),
            Err(RefError::Misaligned { .. })
        ));
    }
}
