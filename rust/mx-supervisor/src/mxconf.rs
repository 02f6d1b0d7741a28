//! Configuration record handed to the firmware at boot.
//!
//! The record lives in shared RAM; its offset goes into mailbox 1 next to
//! [`MXCONF_MAGIC`] in mailbox 2. Every field is a little-endian `u32`.

use std::sync::Arc;

use mif_primitives::{MifRamRef, RingLayout};
use tracing::warn;

use crate::error::MxError;
use crate::shared::SharedRegion;

pub const MXCONF_MAGIC: u32 = 0x7982_8486;
pub const MXCONF_VERSION_MAJOR: u32 = 1;
pub const MXCONF_VERSION_MINOR: u32 = 0;

/// One ring as the firmware sees it.
///
/// `read_bit` is raised by the writer to wake the reader; `write_bit` is
/// raised by the reader once it has freed slots.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamConf {
    pub buffer: u32,
    pub num_packets: u32,
    pub packet_size: u32,
    pub read_index: u32,
    pub write_index: u32,
    pub read_bit: u32,
    pub write_bit: u32,
}

impl StreamConf {
    pub fn ring_layout(&self) -> RingLayout {
        RingLayout {
            buffer: MifRamRef::new(self.buffer),
            slot_count: self.num_packets,
            slot_size: self.packet_size,
            read_index: MifRamRef::new(self.read_index),
            write_index: MifRamRef::new(self.write_index),
        }
    }
}

/// A bidirectional pair of rings.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportConf {
    pub to_host: StreamConf,
    pub from_host: StreamConf,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MxConf {
    pub magic: u32,
    pub version_major: u32,
    pub version_minor: u32,
    pub mgmt: TransportConf,
    pub debug_r4: TransportConf,
    pub debug_m4: TransportConf,
    pub startup_flags: u32,
}

const _: () = assert!(core::mem::size_of::<MxConf>() == 4 * (3 + 3 * 14 + 1));

impl MxConf {
    pub fn new(
        mgmt: TransportConf,
        debug_r4: TransportConf,
        debug_m4: TransportConf,
        startup_flags: u32,
    ) -> Self {
        Self {
            magic: MXCONF_MAGIC,
            version_major: MXCONF_VERSION_MAJOR,
            version_minor: MXCONF_VERSION_MINOR,
            mgmt,
            debug_r4,
            debug_m4,
            startup_flags,
        }
    }

    /// Read a record back out of shared RAM and check its magic.
    pub fn read(shared: &SharedRegion, at: MifRamRef) -> Result<Self, MxError> {
        if !at.is_aligned(4) {
            return Err(MxError::Protocol(format!("mxconf at unaligned {at}")));
        }
        let conf: MxConf = unsafe { shared.region().read_value(at)? };
        if conf.magic != MXCONF_MAGIC {
            return Err(MxError::Protocol(format!(
                "mxconf magic {:#x}, expected {MXCONF_MAGIC:#x}",
                conf.magic
            )));
        }
        if conf.version_major != MXCONF_VERSION_MAJOR {
            return Err(MxError::Protocol(format!(
                "mxconf version {}.{} not supported",
                conf.version_major, conf.version_minor
            )));
        }
        Ok(conf)
    }
}

/// An `MxConf` written into its own shared-RAM allocation.
///
/// Dropping it releases the allocation.
pub struct MxConfBlock {
    shared: Arc<SharedRegion>,
    at: MifRamRef,
}

impl MxConfBlock {
    pub fn write(shared: Arc<SharedRegion>, conf: MxConf) -> Result<Self, MxError> {
        let at = shared.alloc_zeroed(core::mem::size_of::<MxConf>() as u32, 4)?;
        if let Err(e) = unsafe { shared.region().write_value(at, conf) } {
            let _ = shared.free(at);
            return Err(e.into());
        }
        Ok(Self { shared, at })
    }

    #[inline]
    pub fn offset(&self) -> MifRamRef {
        self.at
    }
}

impl Drop for MxConfBlock {
    fn drop(&mut self) {
        if let Err(e) = self.shared.free(self.at) {
            warn!(at = %self.at, error = %e, "failed to free mxconf");
        }
    }
}
