//! Firmware lifecycle manager.
//!
//! Owns the coprocessor's single running instance. The first `open` maps
//! shared RAM, validates and copies the firmware image, builds every
//! transport, hands the configuration record over through the mailboxes,
//! releases reset and waits for the start indication. Later opens only add
//! a user; the last close halts the firmware and tears everything down.
//!
//! Failures are never handled inline. `fail` and `freeze` only record the
//! next state and queue a job for the `mxfail` worker (see `failure.rs`),
//! so they are safe to call from interrupt context.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use mif_primitives::{MifRamRef, Region};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::completion::{Completion, effective_timeout};
use crate::config::{DEFAULT_BOOT_TIMEOUT, DEFAULT_HALT_TIMEOUT, MxConfig};
use crate::debug::DebugTransport;
use crate::error::MxError;
use crate::fwimage::{self, FirmwareHeader, FirmwareLoader, HeaderParser};
use crate::hal::{IrqTarget, MifHal};
use crate::intrbit::{self, IntrBits};
use crate::mbox::{MBOX_ENTRY_POINT, MBOX_MAGIC, MBOX_MXCONF, MBOX_STARTUP_FLAGS, MboxMan};
use crate::mgmt::{ChannelHandler, MgmtTransport};
use crate::msg::{ChannelId, MgmtVerb, log_text};
use crate::mxconf::{MXCONF_MAGIC, MxConf, MxConfBlock};
use crate::panic_record::{PanicCode, PanicRecord, PanicReport};
use crate::shared::SharedRegion;

/// Shared RAM allocations start on the first page after the runtime image.
pub const FW_RAM_ALIGN: u32 = 4096;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MxState {
    Stopped = 0,
    Started = 1,
    Failed = 2,
    Freezed = 3,
}

impl MxState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => MxState::Started,
            2 => MxState::Failed,
            3 => MxState::Freezed,
            _ => MxState::Stopped,
        }
    }
}

/// Why the failure worker was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureCause {
    /// The host declared the failure with this code.
    Host(PanicCode),
    /// The firmware raised a reset request; the code comes from its panic records.
    Firmware,
    Freeze,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Pending {
    pub(crate) next: MxState,
    pub(crate) cause: FailureCause,
}

pub(crate) enum FailureJob {
    Process,
    Shutdown,
}

/// Undoes the HAL side of bring-up: reset handler, reset line, dispatcher, mapping.
struct HalGuard {
    hal: Arc<dyn MifHal>,
    mapped: bool,
    intr: Option<Arc<IntrBits>>,
    reset_handler: bool,
}

impl Drop for HalGuard {
    fn drop(&mut self) {
        if self.reset_handler {
            self.hal.unregister_reset_request_handler();
        }
        if self.mapped
            && let Err(e) = self.hal.reset(true)
        {
            warn!(error = %e, "failed to assert reset");
        }
        if let Some(intr) = self.intr.take() {
            intr.uninstall();
        }
        if self.mapped {
            self.hal.unmap();
        }
    }
}

/// Periodic integrity check of the resident header and const section.
struct CrcMonitor {
    stop: Arc<Completion>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl CrcMonitor {
    fn spawn(
        man: Weak<MxMan>,
        region: Region,
        header: FirmwareHeader,
        config: MxConfig,
        interval: std::time::Duration,
    ) -> Result<Self, MxError> {
        let stop = Arc::new(Completion::new());
        let stop2 = stop.clone();
        let handle = thread::Builder::new()
            .name("mxcrc".into())
            .spawn(move || {
                while let Err(MxError::Timeout(_)) = stop2.wait(Some(interval), "crc interval") {
                    if let Err(e) = header.check_resident(&region, &config) {
                        error!(error = %e, "resident firmware corrupted");
                        if let Some(man) = man.upgrade() {
                            man.fail(PanicCode::host(PanicCode::CRC_MISMATCH));
                        }
                        break;
                    }
                }
                debug!("mxcrc: exiting");
            })?;
        let thread_id = handle.thread().id();
        Ok(Self {
            stop,
            handle: Some(handle),
            thread_id,
        })
    }
}

impl Drop for CrcMonitor {
    fn drop(&mut self) {
        self.stop.complete();
        if let Some(handle) = self.handle.take()
            && thread::current().id() != self.thread_id
            && handle.join().is_err()
        {
            warn!("mxcrc thread panicked");
        }
    }
}

/// Everything acquired by a successful boot. Fields drop in declaration
/// order, which is the reverse of acquisition.
pub(crate) struct Running {
    _crc: Option<CrcMonitor>,
    pub(crate) mgmt: MgmtTransport,
    pub(crate) debug: Vec<DebugTransport>,
    _mxconf: MxConfBlock,
    pub(crate) mbox: Arc<MboxMan>,
    pub(crate) intr: Arc<IntrBits>,
    pub(crate) shared: Arc<SharedRegion>,
    pub(crate) header: FirmwareHeader,
    _guard: HalGuard,
}

pub(crate) struct ManState {
    state: MxState,
    users: u32,
    running: Option<Running>,
}

pub struct MxMan {
    me: Weak<MxMan>,
    hal: Arc<dyn MifHal>,
    config: MxConfig,
    loader: Box<dyn FirmwareLoader>,
    parser: Box<dyn HeaderParser>,
    state: ReentrantMutex<RefCell<ManState>>,
    /// Lock-free copy of `state` for interrupt-context readers.
    mirror: AtomicU8,
    pub(crate) pending: Mutex<Option<Pending>>,
    pub(crate) transport_errored: Arc<AtomicBool>,
    /// Shared with the service manager; cleared when the coprocessor stops.
    srv_errored: Arc<AtomicBool>,
    boot_ack: Arc<Completion>,
    halt_ack: Arc<Completion>,
    pub(crate) recovery: Completion,
    last_panic: Mutex<Option<PanicReport>>,
    fail_tx: mpsc::UnboundedSender<FailureJob>,
    boots: AtomicU32,
}

impl MxMan {
    pub(crate) fn new(
        hal: Arc<dyn MifHal>,
        config: MxConfig,
        loader: Box<dyn FirmwareLoader>,
        parser: Box<dyn HeaderParser>,
        srv_errored: Arc<AtomicBool>,
        fail_tx: mpsc::UnboundedSender<FailureJob>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            hal,
            config,
            loader,
            parser,
            state: ReentrantMutex::new(RefCell::new(ManState {
                state: MxState::Stopped,
                users: 0,
                running: None,
            })),
            mirror: AtomicU8::new(MxState::Stopped as u8),
            pending: Mutex::new(None),
            transport_errored: Arc::new(AtomicBool::new(false)),
            srv_errored,
            boot_ack: Arc::new(Completion::new()),
            halt_ack: Arc::new(Completion::new()),
            recovery: Completion::new(),
            last_panic: Mutex::new(None),
            fail_tx,
            boots: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn state(&self) -> MxState {
        MxState::from_u8(self.mirror.load(Ordering::Acquire))
    }

    pub fn users(&self) -> u32 {
        self.state.lock().borrow().users
    }

    /// Number of successful firmware boots since construction.
    pub fn boot_count(&self) -> u32 {
        self.boots.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &MxConfig {
        &self.config
    }

    pub fn last_panic(&self) -> Option<PanicReport> {
        self.last_panic.lock().clone()
    }

    fn set_state(&self, st: &mut ManState, next: MxState) {
        if st.state != next {
            debug!(from = ?st.state, to = ?next, "mx state");
        }
        st.state = next;
        self.mirror.store(next as u8, Ordering::Release);
    }

    pub(crate) fn lock_state(&self) -> ReentrantMutexGuard<'_, RefCell<ManState>> {
        self.state.lock()
    }

    /// Add a user, booting the firmware if this is the first one.
    pub fn open(&self) -> Result<(), MxError> {
        let guard = self.state.lock();
        {
            let mut st = guard.borrow_mut();
            match st.state {
                MxState::Started => {
                    st.users += 1;
                    debug!(users = st.users, "mx open");
                    return Ok(());
                }
                MxState::Failed | MxState::Freezed => {
                    warn!(state = ?st.state, "open refused until recovery");
                    return Err(MxError::Busy);
                }
                MxState::Stopped => {}
            }
        }

        let running = self.start_firmware().inspect_err(|e| {
            error!(error = %e, "coprocessor failed to start");
        })?;

        let mut st = guard.borrow_mut();
        st.running = Some(running);
        st.users = 1;
        self.set_state(&mut st, MxState::Started);
        info!("coprocessor started");
        Ok(())
    }

    /// Drop a user. The last one halts the firmware and releases everything.
    pub fn close(&self) -> Result<(), MxError> {
        let guard = self.state.lock();
        let (was, running) = {
            let mut st = guard.borrow_mut();
            if st.users == 0 {
                warn!("close with no users");
                return Err(MxError::NotFound);
            }
            st.users -= 1;
            if st.users > 0 {
                debug!(users = st.users, "mx close");
                return Ok(());
            }
            (st.state, st.running.take())
        };

        if let Some(running) = running {
            if was == MxState::Started {
                self.halt(&running);
            }
            drop(running);
        }

        {
            let mut st = guard.borrow_mut();
            self.set_state(&mut st, MxState::Stopped);
        }
        self.srv_errored.store(false, Ordering::Release);
        if matches!(was, MxState::Failed | MxState::Freezed) {
            self.recovery.complete();
        }
        info!(from = ?was, "coprocessor stopped");
        Ok(())
    }

    fn halt(&self, running: &Running) {
        self.halt_ack.reinit();
        if let Err(e) = running
            .mgmt
            .send(ChannelId::Management, &[MgmtVerb::HaltRequest as u8])
        {
            warn!(error = %e, "could not send halt request");
            return;
        }
        let timeout = effective_timeout(self.config.halt_timeout, DEFAULT_HALT_TIMEOUT);
        match self.halt_ack.wait(timeout, "halt acknowledgement") {
            Ok(()) => debug!("firmware halted"),
            Err(e) => warn!(error = %e, "no halt acknowledgement, resetting anyway"),
        }
    }

    fn start_firmware(&self) -> Result<Running, MxError> {
        let mut guard = HalGuard {
            hal: self.hal.clone(),
            mapped: false,
            intr: None,
            reset_handler: false,
        };

        let region = self.hal.map()?;
        guard.mapped = true;

        let image = self.loader.load()?;
        let header = fwimage::validate(self.parser.as_ref(), &image, region.len(), &self.config)?;
        region.write_bytes(MifRamRef::new(0), &image)?;
        region.fill(
            MifRamRef::new(image.len() as u32),
            header.runtime_length as usize - image.len(),
            0,
        )?;

        let alloc_start = header.runtime_length.next_multiple_of(FW_RAM_ALIGN);
        let shared = Arc::new(SharedRegion::new(region, alloc_start));

        let intr = IntrBits::new(self.hal.clone());
        intr.install();
        guard.intr = Some(intr.clone());

        let mbox = Arc::new(MboxMan::new(self.hal.clone()));

        self.transport_errored.store(false, Ordering::Release);
        let mgmt = MgmtTransport::new(
            shared.clone(),
            intr.clone(),
            self.config.mgmt_slot_count,
            self.transport_errored.clone(),
        )?;
        let debug = IrqTarget::ALL
            .iter()
            .map(|&target| {
                DebugTransport::new(
                    shared.clone(),
                    intr.clone(),
                    target,
                    self.config.debug_slot_count,
                    self.config.debug_slot_size,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let conf = MxConf::new(
            mgmt.conf(),
            debug[IrqTarget::R4.index()].conf(),
            debug[IrqTarget::M4.index()].conf(),
            self.config.startup_flags,
        );
        let mxconf = MxConfBlock::write(shared.clone(), conf)?;

        mgmt.register_channel_handler(ChannelId::Management, self.management_handler())?;
        mgmt.register_channel_handler(
            ChannelId::Logging,
            Arc::new(|payload: &[u8]| info!(target: "mx::fw", "{}", log_text(payload))),
        )?;

        mbox.write(MBOX_ENTRY_POINT, header.entry_point);
        mbox.write(MBOX_MXCONF, mxconf.offset().get());
        mbox.write(MBOX_MAGIC, MXCONF_MAGIC);
        mbox.write(MBOX_STARTUP_FLAGS, self.config.startup_flags);

        let me = self.me.clone();
        self.hal
            .register_reset_request_handler(Arc::new(move || {
                if let Some(man) = me.upgrade() {
                    man.request(MxState::Failed, FailureCause::Firmware);
                }
            }));
        guard.reset_handler = true;

        self.boot_ack.reinit();
        self.hal.reset(false)?;
        info!(
            firmware = %self.loader.describe(),
            mxconf = %mxconf.offset(),
            "reset released, waiting for start indication"
        );
        self.boot_ack.wait(
            effective_timeout(self.config.boot_timeout, DEFAULT_BOOT_TIMEOUT),
            "start indication",
        )?;

        let crc = self
            .config
            .crc_check_interval
            .map(|interval| {
                CrcMonitor::spawn(
                    self.me.clone(),
                    region,
                    header,
                    self.config.clone(),
                    interval,
                )
            })
            .transpose()?;

        self.boots.fetch_add(1, Ordering::Relaxed);
        Ok(Running {
            _crc: crc,
            mgmt,
            debug,
            _mxconf: mxconf,
            mbox,
            intr,
            shared,
            header,
            _guard: guard,
        })
    }

    fn management_handler(&self) -> ChannelHandler {
        let boot = self.boot_ack.clone();
        let halt = self.halt_ack.clone();
        Arc::new(move |payload: &[u8]| {
            let Some(&verb) = payload.first() else {
                return;
            };
            match MgmtVerb::from_u8(verb) {
                Some(MgmtVerb::StartIndication) => {
                    debug!("start indication");
                    boot.complete();
                }
                Some(MgmtVerb::HaltRequest) => {
                    debug!("halt acknowledged");
                    halt.complete();
                }
                Some(other) => debug!(verb = ?other, "ignoring management verb from firmware"),
                None => warn!(verb, "unknown management verb"),
            }
        })
    }

    /// Declare the coprocessor failed. Safe from interrupt context.
    pub fn fail(&self, code: PanicCode) {
        self.request(MxState::Failed, FailureCause::Host(code));
    }

    /// Stop services without attempting recovery.
    pub fn freeze(&self) {
        self.request(MxState::Freezed, FailureCause::Freeze);
    }

    pub(crate) fn request(&self, next: MxState, cause: FailureCause) {
        let mut pending = self.pending.lock();
        if let Some(p) = *pending {
            debug!(?cause, pending = ?p.cause, "failure already pending");
            return;
        }
        let state = self.state();
        if state != MxState::Started {
            // A boot in progress gives up immediately.
            self.boot_ack.abort();
            warn!(?cause, ?state, "failure reported while not started, ignored");
            return;
        }
        *pending = Some(Pending { next, cause });
        warn!(?cause, ?next, "coprocessor failure, handing over to failure worker");
        if self.fail_tx.send(FailureJob::Process).is_err() {
            error!("failure worker is gone");
        }
    }

    pub(crate) fn abort_waits(&self) {
        self.boot_ack.abort();
        self.halt_ack.abort();
    }

    pub(crate) fn raise_panic_bits(&self) {
        intrbit::raise_panic(self.hal.as_ref());
    }

    /// Move `Started` to the pending state. Returns the pending request if
    /// the transition happened.
    pub(crate) fn enter_pending(&self, st: &RefCell<ManState>) -> Option<Pending> {
        let pending = self.pending.lock().take()?;
        let mut st = st.borrow_mut();
        if st.state != MxState::Started {
            debug!(state = ?st.state, "failure job ignored");
            return None;
        }
        self.recovery.reinit();
        self.set_state(&mut st, pending.next);
        Some(pending)
    }

    /// Read every core's panic record and fold them into one code.
    pub(crate) fn collect_panic(&self, st: &RefCell<ManState>, cause: FailureCause) -> PanicReport {
        let mut records = Vec::new();
        if cause == FailureCause::Firmware
            && let Some(running) = st.borrow().running.as_ref()
        {
            let region = running.shared.region();
            for target in IrqTarget::ALL {
                let offset = running.header.panic_record_offsets[target.index()];
                if offset == 0 {
                    continue;
                }
                match PanicRecord::read(&region, MifRamRef::new(offset)) {
                    Ok(record) => records.push((target, record)),
                    Err(e) => warn!(core = target.name(), error = %e, "no usable panic record"),
                }
            }
        }
        let code = match cause {
            FailureCause::Host(code) => code,
            _ => records
                .first()
                .map(|(_, r)| r.code())
                .unwrap_or(PanicCode::firmware(0)),
        };
        let report = PanicReport { code, records };
        *self.last_panic.lock() = Some(report.clone());
        report
    }

    pub(crate) fn with_running<R>(
        &self,
        f: impl FnOnce(&Running) -> Result<R, MxError>,
    ) -> Result<R, MxError> {
        let guard = self.state.lock();
        let st = guard.borrow();
        let running = st
            .running
            .as_ref()
            .ok_or(MxError::InvalidState("coprocessor not running"))?;
        f(running)
    }

    pub fn send(&self, channel: ChannelId, payload: &[u8]) -> Result<(), MxError> {
        self.with_running(|r| r.mgmt.send(channel, payload))
    }

    pub fn register_channel_handler(
        &self,
        channel: ChannelId,
        handler: ChannelHandler,
    ) -> Result<(), MxError> {
        self.with_running(|r| r.mgmt.register_channel_handler(channel, handler))
    }

    pub fn unregister_channel_handler(&self, channel: ChannelId) -> Result<(), MxError> {
        self.with_running(|r| r.mgmt.unregister_channel_handler(channel))
    }

    /// Ask the firmware to panic. Recovery then follows the usual path.
    pub fn force_panic(&self) -> Result<(), MxError> {
        info!("forcing firmware panic");
        self.send(ChannelId::Management, &[MgmtVerb::ForcePanic as u8])
    }

    pub fn suspend(&self) -> Result<(), MxError> {
        self.send(ChannelId::Management, &[MgmtVerb::Suspend as u8])
    }

    pub fn resume(&self) -> Result<(), MxError> {
        self.send(ChannelId::Management, &[MgmtVerb::Resume as u8])
    }

    /// Send raw bytes to `target`'s debug stub.
    pub fn debug_send(&self, target: IrqTarget, bytes: &[u8]) -> Result<(), MxError> {
        self.with_running(|r| r.debug[target.index()].send(bytes))
    }

    pub fn register_debug_handler(
        &self,
        target: IrqTarget,
        handler: crate::debug::DebugHandler,
    ) -> Result<(), MxError> {
        self.with_running(|r| r.debug[target.index()].register_handler(handler))
    }

    pub fn unregister_debug_handler(&self, target: IrqTarget) -> Result<(), MxError> {
        self.with_running(|r| r.debug[target.index()].unregister_handler())
    }
}
