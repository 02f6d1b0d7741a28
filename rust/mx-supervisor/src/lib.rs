//! Host-side supervisor for a shared-memory wireless coprocessor.
//!
//! [`Mx`] is the entry point: it owns the firmware lifecycle manager, the
//! service manager, the registered client drivers and the `mxfail` failure
//! worker. Services are opened through it and share one running firmware.
//!
//! The hardware is reached only through the [`MifHal`] trait; [`sim::SimMif`]
//! implements it in memory together with a small firmware model.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub mod completion;
pub mod config;
pub mod debug;
pub mod error;
pub mod fwimage;
pub mod hal;
pub mod intrbit;
pub mod manager;
pub mod mbox;
pub mod mgmt;
pub mod msg;
pub mod mxconf;
pub mod panic_record;
pub mod shared;
pub mod sim;
pub mod stream;

mod clients;
mod failure;
mod service;
mod srvman;

pub use clients::{MxClient, ProbeReason};
pub use config::{MxConfig, RecoveryPolicy};
pub use error::MxError;
pub use fwimage::{FileFirmware, FirmwareLoader, FwHeaderParser, HeaderParser, StaticFirmware};
pub use hal::{IrqTarget, MifHal};
pub use manager::{MxMan, MxState};
pub use panic_record::{PanicCode, PanicRecord, PanicReport};
pub use service::Service;
pub use srvman::{ServiceClient, ServiceId};

use crate::clients::ClientRegistry;
use crate::manager::FailureJob;
use crate::srvman::SrvMan;

pub(crate) struct MxShared {
    pub(crate) man: Arc<MxMan>,
    pub(crate) srvman: Arc<SrvMan>,
    pub(crate) clients: ClientRegistry,
    fail_tx: mpsc::UnboundedSender<FailureJob>,
    worker: Mutex<Option<(JoinHandle<()>, ThreadId)>>,
}

impl Drop for MxShared {
    fn drop(&mut self) {
        let _ = self.fail_tx.send(FailureJob::Shutdown);
        if let Some((handle, id)) = self.worker.lock().take()
            && thread::current().id() != id
            && handle.join().is_err()
        {
            warn!("mxfail thread panicked");
        }
    }
}

/// Cheap, clonable handle to one supervised coprocessor.
#[derive(Clone)]
pub struct Mx {
    pub(crate) shared: Arc<MxShared>,
}

impl Mx {
    /// Build a supervisor for the coprocessor behind `hal`. Nothing touches
    /// the hardware until the first service is opened.
    pub fn new(
        hal: Arc<dyn MifHal>,
        loader: Box<dyn FirmwareLoader>,
        config: MxConfig,
    ) -> Result<Self, MxError> {
        Self::with_parser(hal, loader, Box::new(FwHeaderParser), config)
    }

    pub fn with_parser(
        hal: Arc<dyn MifHal>,
        loader: Box<dyn FirmwareLoader>,
        parser: Box<dyn HeaderParser>,
        config: MxConfig,
    ) -> Result<Self, MxError> {
        config.validate().map_err(MxError::InvalidState)?;

        let (fail_tx, fail_rx) = mpsc::unbounded_channel();
        let srv_errored = Arc::new(AtomicBool::new(false));
        let man = MxMan::new(
            hal,
            config,
            loader,
            parser,
            srv_errored.clone(),
            fail_tx.clone(),
        );
        let shared = Arc::new(MxShared {
            man,
            srvman: SrvMan::new(srv_errored),
            clients: ClientRegistry::default(),
            fail_tx,
            worker: Mutex::new(None),
        });

        let handle = failure::spawn(Arc::downgrade(&shared), fail_rx)?;
        let id = handle.thread().id();
        *shared.worker.lock() = Some((handle, id));
        info!("supervisor ready");
        Ok(Self { shared })
    }

    #[inline]
    pub fn state(&self) -> MxState {
        self.shared.man.state()
    }

    pub fn users(&self) -> u32 {
        self.shared.man.users()
    }

    pub fn boot_count(&self) -> u32 {
        self.shared.man.boot_count()
    }

    pub fn service_count(&self) -> usize {
        self.shared.srvman.service_count()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    pub fn last_panic(&self) -> Option<PanicReport> {
        self.shared.man.last_panic()
    }

    pub fn config(&self) -> &MxConfig {
        self.shared.man.config()
    }

    /// Direct access to the lifecycle manager, for transport-level users.
    pub fn manager(&self) -> &MxMan {
        &self.shared.man
    }

    /// Open service `id`, booting the firmware if it is the first user.
    pub fn open_service(
        &self,
        id: ServiceId,
        client: Arc<dyn ServiceClient>,
    ) -> Result<Service, MxError> {
        let entry = self.shared.srvman.open(&self.shared.man, id, client)?;
        Ok(Service::new(self.clone(), entry))
    }

    /// Register a client driver and probe it immediately.
    pub fn register_client(&self, client: Arc<dyn MxClient>) {
        self.shared.clients.register(self, client);
    }

    pub fn unregister_client(&self, client: &Arc<dyn MxClient>) -> Result<(), MxError> {
        if self.shared.clients.unregister(self, client) {
            Ok(())
        } else {
            Err(MxError::NotFound)
        }
    }

    /// Declare the coprocessor failed. Safe from interrupt context.
    pub fn fail(&self, code: PanicCode) {
        self.shared.man.fail(code);
    }

    pub fn freeze(&self) {
        self.shared.man.freeze();
    }

    pub fn force_panic(&self) -> Result<(), MxError> {
        self.shared.man.force_panic()
    }

    pub fn suspend(&self) -> Result<(), MxError> {
        self.shared.man.suspend()
    }

    pub fn resume(&self) -> Result<(), MxError> {
        self.shared.man.resume()
    }
}
