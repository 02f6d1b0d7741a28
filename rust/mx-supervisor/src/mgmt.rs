//! Management transport: channel-multiplexed 8-byte packets over a stream pair.
//!
//! Outbound packets are written synchronously by the caller. Inbound packets
//! are drained on a dedicated `mxmgmt` thread, woken by the to-host
//! interrupt, one packet at a time: the channel handler runs while the
//! packet is still in the ring and the slot is only released afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::MxError;
use crate::hal::IrqTarget;
use crate::intrbit::IntrBits;
use crate::msg::{ChannelId, MGMT_PACKET_SIZE, MGMT_PAYLOAD_MAX};
use crate::mxconf::TransportConf;
use crate::shared::SharedRegion;
use crate::stream::{MifStream, StreamDirection, ack_only};

/// Receives the payload (channel byte stripped, padding included).
pub type ChannelHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

enum Wake {
    Data,
    Shutdown,
}

struct MgmtShared {
    to_host: MifStream,
    from_host: MifStream,
    send_lock: Mutex<()>,
    handlers: Mutex<[Option<ChannelHandler>; ChannelId::COUNT]>,
    errored: Arc<AtomicBool>,
}

pub struct MgmtTransport {
    shared: Arc<MgmtShared>,
    wake: mpsc::UnboundedSender<Wake>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl MgmtTransport {
    /// Allocate both streams on the R4 core and start the inbound thread.
    ///
    /// `errored` is shared with the failure path, which sets it to make
    /// every later `send` fail fast.
    pub fn new(
        shared_region: Arc<SharedRegion>,
        intr: Arc<IntrBits>,
        slot_count: u32,
        errored: Arc<AtomicBool>,
    ) -> Result<Self, MxError> {
        let (wake, mut rx) = mpsc::unbounded_channel();

        let tx = wake.clone();
        let to_host = MifStream::new(
            shared_region.clone(),
            intr.clone(),
            StreamDirection::ToHost,
            IrqTarget::R4,
            slot_count,
            MGMT_PACKET_SIZE,
            Arc::new(move |intr: &IntrBits, bit: u8| {
                intr.clear(bit);
                let _ = tx.send(Wake::Data);
            }),
        )?;
        let from_host = MifStream::new(
            shared_region,
            intr,
            StreamDirection::FromHost,
            IrqTarget::R4,
            slot_count,
            MGMT_PACKET_SIZE,
            ack_only(),
        )?;

        let shared = Arc::new(MgmtShared {
            to_host,
            from_host,
            send_lock: Mutex::new(()),
            handlers: Mutex::new(Default::default()),
            errored,
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("mxmgmt".into())
            .spawn(move || {
                while let Some(wake) = rx.blocking_recv() {
                    match wake {
                        Wake::Data => worker_shared.drain(),
                        Wake::Shutdown => break,
                    }
                }
                trace!("mxmgmt: exiting");
            })?;
        let worker_id = worker.thread().id();

        Ok(Self {
            shared,
            wake,
            worker: Some(worker),
            worker_id,
        })
    }

    pub fn conf(&self) -> TransportConf {
        TransportConf {
            to_host: self.shared.to_host.conf(),
            from_host: self.shared.from_host.conf(),
        }
    }

    /// Send `payload` (at most seven bytes) on `channel`.
    pub fn send(&self, channel: ChannelId, payload: &[u8]) -> Result<(), MxError> {
        if self.shared.errored.load(Ordering::Acquire) {
            return Err(MxError::TransportErrored);
        }
        if payload.len() > MGMT_PAYLOAD_MAX {
            return Err(MxError::Protocol(format!(
                "management payload of {} bytes (max {MGMT_PAYLOAD_MAX})",
                payload.len()
            )));
        }

        let _guard = self.shared.send_lock.lock();
        let ring = self.shared.from_host.ring();
        if !ring.write_gather(&[&[channel as u8], payload]) {
            warn!(?channel, "management ring full");
            return Err(MxError::ResourceExhausted("management ring"));
        }
        self.shared.from_host.signal();
        trace!(?channel, len = payload.len(), "mgmt send");
        Ok(())
    }

    pub fn register_channel_handler(
        &self,
        channel: ChannelId,
        handler: ChannelHandler,
    ) -> Result<(), MxError> {
        let mut handlers = self.shared.handlers.lock();
        let slot = &mut handlers[channel.index()];
        if slot.is_some() {
            return Err(MxError::AlreadyInProgress);
        }
        *slot = Some(handler);
        debug!(?channel, "registered channel handler");
        Ok(())
    }

    pub fn unregister_channel_handler(&self, channel: ChannelId) -> Result<(), MxError> {
        let mut handlers = self.shared.handlers.lock();
        match handlers[channel.index()].take() {
            Some(_) => {
                debug!(?channel, "unregistered channel handler");
                Ok(())
            }
            None => Err(MxError::NotFound),
        }
    }

    pub fn set_error(&self, errored: bool) {
        self.shared.errored.store(errored, Ordering::Release);
    }

    pub fn is_errored(&self) -> bool {
        self.shared.errored.load(Ordering::Acquire)
    }
}

impl MgmtShared {
    fn drain(&self) {
        let ring = self.to_host.ring();
        let mut consumed = false;
        while let Some(slot) = ring.peek(None) {
            let data = slot.data();
            match ChannelId::from_u8(data[0]) {
                Some(channel) => {
                    let handler = self.handlers.lock()[channel.index()].clone();
                    match handler {
                        Some(handler) => handler(&data[1..]),
                        None => warn!(?channel, "no handler for channel, dropping packet"),
                    }
                }
                None => warn!(channel = data[0], "unknown channel, dropping packet"),
            }
            ring.peek_complete(slot.index());
            consumed = true;
        }
        if consumed {
            self.to_host.signal();
        }
    }
}

impl Drop for MgmtTransport {
    fn drop(&mut self) {
        let _ = self.wake.send(Wake::Shutdown);
        if let Some(worker) = self.worker.take() {
            if thread::current().id() == self.worker_id {
                // Torn down from one of our own channel handlers.
                return;
            }
            if worker.join().is_err() {
                warn!("mxmgmt thread panicked");
            }
        }
    }
}
