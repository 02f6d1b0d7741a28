//! A ring plus the interrupt bits that drive it.

use std::sync::Arc;

use mif_primitives::{MifRamRef, PacketRing, RingLayout};
use tracing::warn;

use crate::error::MxError;
use crate::hal::IrqTarget;
use crate::intrbit::{IntrBits, TohostHandler};
use crate::mxconf::StreamConf;
use crate::shared::SharedRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Firmware writes, host reads.
    ToHost,
    /// Host writes, firmware reads.
    FromHost,
}

/// Everything a stream holds in the shared region; released on drop.
struct StreamResources {
    shared: Arc<SharedRegion>,
    intr: Arc<IntrBits>,
    target: IrqTarget,
    ram: Vec<MifRamRef>,
    fromhost_bit: Option<u8>,
    tohost_bit: Option<u8>,
}

impl StreamResources {
    fn alloc(&mut self, bytes: u32, align: u32) -> Result<MifRamRef, MxError> {
        let r = self.shared.alloc_zeroed(bytes, align)?;
        self.ram.push(r);
        Ok(r)
    }
}

impl Drop for StreamResources {
    fn drop(&mut self) {
        if let Some(bit) = self.tohost_bit.take()
            && let Err(e) = self.intr.unregister_tohost(bit)
        {
            warn!(bit, error = %e, "stream: failed to release to-host bit");
        }
        if let Some(bit) = self.fromhost_bit.take()
            && let Err(e) = self.intr.free_fromhost(bit, self.target)
        {
            warn!(bit, error = %e, "stream: failed to release from-host bit");
        }
        for r in self.ram.drain(..) {
            if let Err(e) = self.shared.free(r) {
                warn!(%r, error = %e, "stream: failed to free ring memory");
            }
        }
    }
}

/// One direction of a transport.
///
/// Both directions own one to-host bit (with a handler) and one from-host
/// bit on `target`. The host always signals the firmware on the from-host
/// bit, whether it has written packets or freed slots.
pub struct MifStream {
    ring: PacketRing,
    direction: StreamDirection,
    tohost_bit: u8,
    fromhost_bit: u8,
    res: StreamResources,
}

impl MifStream {
    pub fn new(
        shared: Arc<SharedRegion>,
        intr: Arc<IntrBits>,
        direction: StreamDirection,
        target: IrqTarget,
        slot_count: u32,
        slot_size: u32,
        handler: TohostHandler,
    ) -> Result<Self, MxError> {
        let mut res = StreamResources {
            shared: shared.clone(),
            intr: intr.clone(),
            target,
            ram: Vec::with_capacity(3),
            fromhost_bit: None,
            tohost_bit: None,
        };

        let data_len = slot_count
            .checked_mul(slot_size)
            .ok_or(MxError::ResourceExhausted("stream buffer"))?;
        let layout = RingLayout {
            buffer: res.alloc(data_len, 64)?,
            slot_count,
            slot_size,
            read_index: res.alloc(4, 4)?,
            write_index: res.alloc(4, 4)?,
        };
        let ring = unsafe { PacketRing::init(shared.region(), layout)? };

        let fromhost_bit = intr.alloc_fromhost(target)?;
        res.fromhost_bit = Some(fromhost_bit);
        let tohost_bit = intr.register_tohost(handler)?;
        res.tohost_bit = Some(tohost_bit);

        Ok(Self {
            ring,
            direction,
            tohost_bit,
            fromhost_bit,
            res,
        })
    }

    #[inline]
    pub fn ring(&self) -> &PacketRing {
        &self.ring
    }

    #[inline]
    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    #[inline]
    pub fn target(&self) -> IrqTarget {
        self.res.target
    }

    #[inline]
    pub fn tohost_bit(&self) -> u8 {
        self.tohost_bit
    }

    #[inline]
    pub fn fromhost_bit(&self) -> u8 {
        self.fromhost_bit
    }

    /// Raise this stream's from-host bit.
    pub fn signal(&self) {
        self.res.intr.set(self.fromhost_bit, self.res.target);
    }

    /// The stream as advertised in the configuration record.
    pub fn conf(&self) -> StreamConf {
        let layout = self.ring.layout();
        let (read_bit, write_bit) = match self.direction {
            StreamDirection::ToHost => (self.tohost_bit, self.fromhost_bit),
            StreamDirection::FromHost => (self.fromhost_bit, self.tohost_bit),
        };
        StreamConf {
            buffer: layout.buffer.get(),
            num_packets: layout.slot_count,
            packet_size: layout.slot_size,
            read_index: layout.read_index.get(),
            write_index: layout.write_index.get(),
            read_bit: read_bit as u32,
            write_bit: write_bit as u32,
        }
    }
}

/// To-host handler for bits nobody waits on: just acknowledge.
pub fn ack_only() -> TohostHandler {
    Arc::new(|intr: &IntrBits, bit: u8| intr.clear(bit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMif;

    #[test]
    fn drop_returns_everything() {
        let sim = SimMif::new(256 * 1024);
        let region = sim.region();
        let shared = Arc::new(SharedRegion::new(region, 64 * 1024));
        let intr = IntrBits::new(sim.hal());
        let blocks = shared.free_blocks();

        let stream = MifStream::new(
            shared.clone(),
            intr.clone(),
            StreamDirection::FromHost,
            IrqTarget::M4,
            32,
            8,
            ack_only(),
        )
        .unwrap();
        let conf = stream.conf();
        assert_eq!(conf.read_bit, stream.fromhost_bit() as u32);
        assert_eq!(conf.write_bit, stream.tohost_bit() as u32);
        assert_eq!(conf.num_packets, 32);
        assert_eq!(intr.tohost_in_use(), 1);
        assert_eq!(intr.fromhost_in_use(IrqTarget::M4), 2);
        assert!(shared.free_blocks() < blocks);

        drop(stream);
        assert_eq!(shared.free_blocks(), blocks);
        assert_eq!(intr.tohost_in_use(), 0);
        assert_eq!(intr.fromhost_in_use(IrqTarget::M4), 1);
    }

    #[test]
    fn partial_construction_rolls_back() {
        let sim = SimMif::new(256 * 1024);
        let shared = Arc::new(SharedRegion::new(sim.region(), 64 * 1024));
        let intr = IntrBits::new(sim.hal());
        for _ in 0..15 {
            intr.alloc_fromhost(IrqTarget::R4).unwrap();
        }
        let blocks = shared.free_blocks();
        let err = MifStream::new(
            shared.clone(),
            intr,
            StreamDirection::ToHost,
            IrqTarget::R4,
            16,
            8,
            ack_only(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, MxError::ResourceExhausted(_)));
        assert_eq!(shared.free_blocks(), blocks);
    }
}
