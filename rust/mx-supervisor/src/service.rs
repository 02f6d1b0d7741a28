//! An open service: start/stop handshakes plus the per-service resource API.

use std::sync::Arc;

use mif_primitives::MifRamRef;
use tracing::{debug, warn};

use crate::Mx;
use crate::error::MxError;
use crate::hal::IrqTarget;
use crate::intrbit::TohostHandler;
use crate::manager::Running;
use crate::msg::SrvVerb;
use crate::panic_record::PanicCode;
use crate::srvman::{ServiceEntry, ServiceId};

/// Handle returned by [`Mx::open_service`]. Closing it (or dropping it)
/// releases one user of the coprocessor.
pub struct Service {
    mx: Mx,
    entry: Arc<ServiceEntry>,
    closed: bool,
}

impl Service {
    pub(crate) fn new(mx: Mx, entry: Arc<ServiceEntry>) -> Self {
        Self {
            mx,
            entry,
            closed: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ServiceId {
        self.entry.id
    }

    pub fn mx(&self) -> &Mx {
        &self.mx
    }

    /// Ask the firmware to start the service with its configuration at `config`.
    pub fn start(&self, config: MifRamRef) -> Result<(), MxError> {
        debug!(id = self.id(), %config, "service start");
        let shared = &self.mx.shared;
        shared
            .srvman
            .request(&shared.man, &self.entry, SrvVerb::StartReq, config.get())
    }

    pub fn stop(&self) -> Result<(), MxError> {
        debug!(id = self.id(), "service stop");
        let shared = &self.mx.shared;
        shared
            .srvman
            .request(&shared.man, &self.entry, SrvVerb::StopReq, 0)
    }

    pub fn close(mut self) -> Result<(), MxError> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<(), MxError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let shared = &self.mx.shared;
        shared.srvman.close(&shared.man, &self.entry)
    }

    /// Declare the coprocessor failed on behalf of this service.
    pub fn report_failure(&self, reason: u16) {
        warn!(id = self.id(), reason, "service reported failure");
        self.mx.fail(PanicCode::host(reason));
    }

    /// Run `f` against the live coprocessor resources, failing fast once
    /// the service manager is in error.
    fn with_running<R>(
        &self,
        f: impl FnOnce(&Running) -> Result<R, MxError>,
    ) -> Result<R, MxError> {
        let shared = &self.mx.shared;
        if shared.srvman.is_errored() {
            return Err(MxError::errored());
        }
        shared.man.with_running(f)
    }

    pub fn mifram_alloc(&self, bytes: u32, align: u32) -> Result<MifRamRef, MxError> {
        self.with_running(|r| r.shared.alloc(bytes, align))
    }

    pub fn mifram_alloc_zeroed(&self, bytes: u32, align: u32) -> Result<MifRamRef, MxError> {
        self.with_running(|r| r.shared.alloc_zeroed(bytes, align))
    }

    pub fn mifram_free(&self, r: MifRamRef) -> Result<(), MxError> {
        self.with_running(|run| run.shared.free(r))
    }

    pub fn ptr_of(&self, r: MifRamRef) -> Result<*mut u8, MxError> {
        self.with_running(|run| run.shared.ptr_of(r))
    }

    pub fn ref_of(&self, ptr: *const u8) -> Result<MifRamRef, MxError> {
        self.with_running(|run| run.shared.ref_of(ptr))
    }

    pub fn register_tohost_irq(&self, handler: TohostHandler) -> Result<u8, MxError> {
        self.with_running(|r| r.intr.register_tohost(handler))
    }

    pub fn unregister_tohost_irq(&self, bit: u8) -> Result<(), MxError> {
        self.with_running(|r| r.intr.unregister_tohost(bit))
    }

    pub fn alloc_fromhost_irq(&self, target: IrqTarget) -> Result<u8, MxError> {
        self.with_running(|r| r.intr.alloc_fromhost(target))
    }

    pub fn free_fromhost_irq(&self, bit: u8, target: IrqTarget) -> Result<(), MxError> {
        self.with_running(|r| r.intr.free_fromhost(bit, target))
    }

    pub fn set_irq(&self, bit: u8, target: IrqTarget) -> Result<(), MxError> {
        self.with_running(|r| {
            r.intr.set(bit, target);
            Ok(())
        })
    }

    pub fn clear_irq(&self, bit: u8) -> Result<(), MxError> {
        self.with_running(|r| {
            r.intr.clear(bit);
            Ok(())
        })
    }

    pub fn mask_irq(&self, bit: u8) -> Result<(), MxError> {
        self.with_running(|r| {
            r.intr.mask(bit);
            Ok(())
        })
    }

    pub fn unmask_irq(&self, bit: u8) -> Result<(), MxError> {
        self.with_running(|r| {
            r.intr.unmask(bit);
            Ok(())
        })
    }

    /// Reserve `n` consecutive mailboxes; returns the first index.
    pub fn alloc_mboxes(&self, n: u32) -> Result<u32, MxError> {
        self.with_running(|r| r.mbox.alloc_mboxes(n))
    }

    pub fn free_mboxes(&self, first: u32, n: u32) -> Result<(), MxError> {
        self.with_running(|r| {
            r.mbox.free_mboxes(first, n);
            Ok(())
        })
    }

    pub fn mbox_write(&self, index: u32, value: u32) -> Result<(), MxError> {
        self.with_running(|r| {
            r.mbox.write(index, value);
            Ok(())
        })
    }

    pub fn mbox_read(&self, index: u32) -> Result<u32, MxError> {
        self.with_running(|r| Ok(r.mbox.read(index)))
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!(id = self.entry.id, error = %e, "service close on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::sim::{SimBehaviour, SimMif, sim_image};
    use crate::{MxConfig, ServiceClient, StaticFirmware};

    struct Quiet;

    impl ServiceClient for Quiet {
        fn stop_on_failure(&self) {}
        fn failure_reset(&self, _code: PanicCode) {}
    }

    #[test]
    fn expired_wait_stops_expecting_a_confirm() {
        let sim = SimMif::new(1024 * 1024);
        let config = MxConfig {
            service_timeout: Duration::from_millis(100),
            crc_check_interval: None,
            ..MxConfig::default()
        };
        let mx = Mx::new(sim.hal(), Box::new(StaticFirmware(sim_image())), config).unwrap();
        sim.set_behaviour(SimBehaviour {
            confirm_services: false,
            ..SimBehaviour::default()
        });
        let s = mx.open_service(1, Arc::new(Quiet)).unwrap();

        assert!(matches!(
            s.start(MifRamRef::new(0)),
            Err(MxError::Timeout(_))
        ));
        assert_eq!(s.entry.awaiting(), None);
        s.close().unwrap();
    }
}
