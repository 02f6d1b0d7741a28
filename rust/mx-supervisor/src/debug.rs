//! Raw byte pipe to one core's debug stub.

use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::MxError;
use crate::hal::IrqTarget;
use crate::intrbit::IntrBits;
use crate::mxconf::TransportConf;
use crate::shared::SharedRegion;
use crate::stream::{MifStream, StreamDirection, ack_only};

pub type DebugHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

enum Wake {
    Data,
    Shutdown,
}

struct DebugShared {
    to_host: MifStream,
    from_host: MifStream,
    send_lock: Mutex<()>,
    handler: Mutex<Option<DebugHandler>>,
}

pub struct DebugTransport {
    target: IrqTarget,
    shared: Arc<DebugShared>,
    wake: mpsc::UnboundedSender<Wake>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl DebugTransport {
    pub fn new(
        shared_region: Arc<SharedRegion>,
        intr: Arc<IntrBits>,
        target: IrqTarget,
        slot_count: u32,
        slot_size: u32,
    ) -> Result<Self, MxError> {
        let (wake, mut rx) = mpsc::unbounded_channel();
        let tx = wake.clone();
        let to_host = MifStream::new(
            shared_region.clone(),
            intr.clone(),
            StreamDirection::ToHost,
            target,
            slot_count,
            slot_size,
            Arc::new(move |intr: &IntrBits, bit: u8| {
                intr.clear(bit);
                let _ = tx.send(Wake::Data);
            }),
        )?;
        let from_host = MifStream::new(
            shared_region,
            intr,
            StreamDirection::FromHost,
            target,
            slot_count,
            slot_size,
            ack_only(),
        )?;
        let shared = Arc::new(DebugShared {
            to_host,
            from_host,
            send_lock: Mutex::new(()),
            handler: Mutex::new(None),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name(format!("mxdbg-{}", target.name()))
            .spawn(move || {
                let mut buf = vec![0u8; slot_size as usize * slot_count as usize];
                while let Some(Wake::Data) = rx.blocking_recv() {
                    worker_shared.drain(&mut buf);
                }
            })?;
        let worker_id = worker.thread().id();

        Ok(Self {
            target,
            shared,
            wake,
            worker: Some(worker),
            worker_id,
        })
    }

    #[inline]
    pub fn target(&self) -> IrqTarget {
        self.target
    }

    pub fn conf(&self) -> TransportConf {
        TransportConf {
            to_host: self.shared.to_host.conf(),
            from_host: self.shared.from_host.conf(),
        }
    }

    /// Queue bytes for the debug stub. Short final slots are zero padded.
    pub fn send(&self, bytes: &[u8]) -> Result<(), MxError> {
        let _guard = self.shared.send_lock.lock();
        if !self.shared.from_host.ring().write(bytes) {
            return Err(MxError::ResourceExhausted("debug ring"));
        }
        self.shared.from_host.signal();
        Ok(())
    }

    pub fn register_handler(&self, handler: DebugHandler) -> Result<(), MxError> {
        let mut slot = self.shared.handler.lock();
        if slot.is_some() {
            return Err(MxError::AlreadyInProgress);
        }
        *slot = Some(handler);
        Ok(())
    }

    pub fn unregister_handler(&self) -> Result<(), MxError> {
        self.shared
            .handler
            .lock()
            .take()
            .map(|_| ())
            .ok_or(MxError::NotFound)
    }
}

impl DebugShared {
    fn drain(&self, buf: &mut [u8]) {
        loop {
            let n = self.to_host.ring().read(buf);
            if n == 0 {
                break;
            }
            self.to_host.signal();
            let handler = self.handler.lock().clone();
            match handler {
                Some(handler) => handler(&buf[..n]),
                None => trace!(bytes = n, "debug data with no reader, dropped"),
            }
        }
    }
}

impl Drop for DebugTransport {
    fn drop(&mut self) {
        let _ = self.wake.send(Wake::Shutdown);
        if let Some(worker) = self.worker.take() {
            if thread::current().id() == self.worker_id {
                return;
            }
            if worker.join().is_err() {
                warn!(core = self.target.name(), "mxdbg thread panicked");
            }
        }
    }
}
