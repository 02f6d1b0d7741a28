//! Service manager: many services sharing one running coprocessor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::completion::{Completion, effective_timeout};
use crate::config::{DEFAULT_RECOVERY_TIMEOUT, DEFAULT_SERVICE_TIMEOUT};
use crate::error::MxError;
use crate::manager::{MxMan, MxState};
use crate::mgmt::ChannelHandler;
use crate::msg::{ChannelId, SrvMsg, SrvVerb};
use crate::panic_record::PanicCode;

pub type ServiceId = u8;

/// Callbacks a service owner receives when the coprocessor fails.
pub trait ServiceClient: Send + Sync {
    /// The coprocessor is gone; stop touching shared resources.
    fn stop_on_failure(&self);
    /// Recovery is under way after a failure with `code`.
    fn failure_reset(&self, code: PanicCode);
}

pub(crate) struct ServiceEntry {
    pub(crate) id: ServiceId,
    client: Arc<dyn ServiceClient>,
    completion: Completion,
    busy: AtomicBool,
    /// The confirm verb the in-flight request expects.
    awaiting: Mutex<Option<SrvVerb>>,
}

#[cfg(test)]
impl ServiceEntry {
    pub(crate) fn awaiting(&self) -> Option<SrvVerb> {
        *self.awaiting.lock()
    }
}

#[derive(Default)]
struct SrvTable {
    services: Vec<Arc<ServiceEntry>>,
    /// Ids between the duplicate check and the end of `open`.
    opening: Vec<ServiceId>,
}

pub(crate) struct SrvMan {
    table: Mutex<SrvTable>,
    /// Held from the emptiness check through the table change, so the
    /// service-management handler is registered exactly while services exist.
    membership: Mutex<()>,
    errored: Arc<AtomicBool>,
    post_lock: Mutex<()>,
}

impl SrvMan {
    pub(crate) fn new(errored: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(SrvTable::default()),
            membership: Mutex::new(()),
            errored,
            post_lock: Mutex::new(()),
        })
    }

    pub(crate) fn set_error(&self, errored: bool) {
        self.errored.store(errored, Ordering::Release);
    }

    pub(crate) fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    pub(crate) fn service_count(&self) -> usize {
        self.table.lock().services.len()
    }

    pub(crate) fn open(
        self: &Arc<Self>,
        man: &MxMan,
        id: ServiceId,
        client: Arc<dyn ServiceClient>,
    ) -> Result<Arc<ServiceEntry>, MxError> {
        {
            let mut table = self.table.lock();
            if table.services.iter().any(|s| s.id == id) || table.opening.contains(&id) {
                warn!(id, "service already open");
                return Err(MxError::AlreadyInProgress);
            }
            table.opening.push(id);
        }

        let result = self.open_inner(man, id, client);
        self.table.lock().opening.retain(|&o| o != id);
        let entry = result?;
        info!(id, services = self.service_count(), "service opened");
        Ok(entry)
    }

    fn open_inner(
        self: &Arc<Self>,
        man: &MxMan,
        id: ServiceId,
        client: Arc<dyn ServiceClient>,
    ) -> Result<Arc<ServiceEntry>, MxError> {
        if man.state() == MxState::Failed {
            info!(id, "coprocessor failed, waiting for recovery");
            let timeout =
                effective_timeout(man.config().recovery_timeout, DEFAULT_RECOVERY_TIMEOUT);
            man.recovery.wait(timeout, "recovery")?;
        }

        man.open()?;

        let entry = Arc::new(ServiceEntry {
            id,
            client,
            completion: Completion::new(),
            busy: AtomicBool::new(false),
            awaiting: Mutex::new(None),
        });

        let _membership = self.membership.lock();
        if self.table.lock().services.is_empty() {
            match man.register_channel_handler(ChannelId::ServiceManagement, self.confirm_handler())
            {
                Ok(()) | Err(MxError::AlreadyInProgress) => {}
                Err(e) => {
                    if let Err(close_err) = man.close() {
                        warn!(id, error = %close_err, "rollback close failed");
                    }
                    return Err(e);
                }
            }
        }
        self.table.lock().services.push(entry.clone());
        Ok(entry)
    }

    pub(crate) fn close(&self, man: &MxMan, entry: &Arc<ServiceEntry>) -> Result<(), MxError> {
        let membership = self.membership.lock();
        let last = {
            let mut table = self.table.lock();
            let before = table.services.len();
            table.services.retain(|s| !Arc::ptr_eq(s, entry));
            if table.services.len() == before {
                return Err(MxError::NotFound);
            }
            table.services.is_empty()
        };
        if last {
            match man.unregister_channel_handler(ChannelId::ServiceManagement) {
                Ok(()) | Err(MxError::NotFound) | Err(MxError::InvalidState(_)) => {}
                Err(e) => warn!(error = %e, "failed to unregister service handler"),
            }
        }
        drop(membership);
        info!(id = entry.id, "service closed");
        man.close()
    }

    /// Send `verb` for `entry` and wait for the matching confirm.
    pub(crate) fn request(
        &self,
        man: &MxMan,
        entry: &ServiceEntry,
        verb: SrvVerb,
        data: u32,
    ) -> Result<(), MxError> {
        if self.is_errored() {
            return Err(MxError::errored());
        }
        if entry.busy.swap(true, Ordering::AcqRel) {
            return Err(MxError::Busy);
        }

        let result = self.post_and_wait(man, entry, verb, data);
        entry.busy.store(false, Ordering::Release);
        if let Err(e) = &result {
            warn!(id = entry.id, ?verb, error = %e, "service request failed");
        }
        result
    }

    fn post_and_wait(
        &self,
        man: &MxMan,
        entry: &ServiceEntry,
        verb: SrvVerb,
        data: u32,
    ) -> Result<(), MxError> {
        {
            let _post = self.post_lock.lock();
            if self.is_errored() {
                return Err(MxError::errored());
            }
            entry.completion.reinit();
            *entry.awaiting.lock() = verb.confirm();
            let msg = SrvMsg {
                service_id: entry.id,
                verb,
                data,
            };
            man.send(ChannelId::ServiceManagement, &msg.encode())?;
        }
        let timeout = effective_timeout(man.config().service_timeout, DEFAULT_SERVICE_TIMEOUT);
        let what = match verb {
            SrvVerb::StopReq => "service stop confirm",
            _ => "service start confirm",
        };
        let result = entry.completion.wait(timeout, what);
        if result.is_err() {
            // A confirm arriving now answers nothing.
            *entry.awaiting.lock() = None;
        }
        result
    }

    fn confirm_handler(self: &Arc<Self>) -> ChannelHandler {
        let srvman = Arc::downgrade(self);
        Arc::new(move |payload: &[u8]| {
            let Some(srvman) = srvman.upgrade() else {
                return;
            };
            let msg = match SrvMsg::decode(payload) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(error = %e, "dropping service message");
                    return;
                }
            };
            let entry = srvman
                .table
                .lock()
                .services
                .iter()
                .find(|s| s.id == msg.service_id)
                .cloned();
            let Some(entry) = entry else {
                warn!(id = msg.service_id, verb = ?msg.verb, "message for unknown service");
                return;
            };
            {
                let mut awaiting = entry.awaiting.lock();
                if *awaiting != Some(msg.verb) {
                    warn!(id = entry.id, verb = ?msg.verb, expected = ?*awaiting, "unexpected service message");
                    return;
                }
                *awaiting = None;
            }
            debug!(id = entry.id, verb = ?msg.verb, "service confirm");
            entry.completion.complete();
        })
    }

    /// Abort every pending start/stop wait. Requests posted after this see
    /// the error flag.
    pub(crate) fn abort_waits(&self) {
        let _post = self.post_lock.lock();
        for entry in &self.table.lock().services {
            entry.completion.abort();
        }
    }

    /// Snapshot the services once no request is being posted. Must not be
    /// called with the manager state lock held.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ServiceEntry>> {
        let _post = self.post_lock.lock();
        self.table.lock().services.clone()
    }

    /// `stop_on_failure` to every service in `services`, in order.
    pub(crate) fn freeze_services(&self, services: &[Arc<ServiceEntry>]) {
        for entry in services {
            debug!(id = entry.id, "stop_on_failure");
            entry.client.stop_on_failure();
        }
    }

    /// `failure_reset` to every service, in registration order.
    pub(crate) fn unfreeze_services(&self, code: PanicCode) {
        for entry in self.snapshot() {
            debug!(id = entry.id, %code, "failure_reset");
            entry.client.failure_reset(code);
        }
    }
}
