#![doc = include_str!("../README.md")]
#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod bitmap;
pub mod mifram;
pub mod ram;
pub mod region;
pub mod ring;

pub use bitmap::{BITMAP_MAX_ENTRIES, BitmapAllocator, Exhausted};
pub use mifram::{MifRamRef, RefError};
pub use ram::{BlockStatus, RAM_BLOCK_SIZE, RamAllocator, RamFreeError};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use ring::{PacketRing, PeekedSlot, RingError, RingLayout, RingStatus};
