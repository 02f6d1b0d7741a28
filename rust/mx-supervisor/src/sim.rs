//! In-memory shared-memory interface plus a small firmware model.
//!
//! [`SimMif`] implements [`MifHal`] over a heap allocation. Releasing reset
//! starts a `simfw` thread that behaves like a minimal firmware: it follows
//! the mailbox handshake to the configuration record, attaches to every
//! ring, sends the start indication, echoes halt requests, confirms service
//! requests, echoes debug bytes and panics on request.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use mif_primitives::{HeapRegion, MifRamRef, PacketRing, Region};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::fwimage::ImageBuilder;
use crate::hal::{IRQ_BIT_COUNT, IrqTarget, MifHal, MifIrqHandler, ResetRequestHandler};
use crate::intrbit::PANIC_FROMHOST_BIT;
use crate::mbox::{MBOX_MAGIC, MBOX_MXCONF};
use crate::msg::{ChannelId, MGMT_PACKET_SIZE, MGMT_PAYLOAD_MAX, MgmtVerb, SrvMsg};
use crate::mxconf::{MXCONF_MAGIC, MxConf, StreamConf};
use crate::panic_record::PanicRecord;

pub const SIM_MAILBOXES: u32 = 32;
/// Where [`sim_image`] asks each core to leave its panic record.
pub const SIM_PANIC_RECORD_OFFSETS: [u32; 2] = [0x8000, 0x8100];
/// Code used when the host forces a panic.
pub const SIM_FORCED_PANIC_CODE: u32 = 0xf0_0d;

const POLL: Duration = Duration::from_millis(50);

/// A firmware image for the simulator, with panic record slots inside its
/// runtime area.
pub fn sim_image() -> Vec<u8> {
    ImageBuilder {
        panic_record_offsets: SIM_PANIC_RECORD_OFFSETS,
        ..ImageBuilder::default()
    }
    .build()
}

/// Knobs for making the firmware misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimBehaviour {
    pub boot_ack: bool,
    pub halt_ack: bool,
    pub confirm_services: bool,
}

impl Default for SimBehaviour {
    fn default() -> Self {
        Self {
            boot_ack: true,
            halt_ack: true,
            confirm_services: true,
        }
    }
}

/// Things the firmware saw or did, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Booted { startup_flags: u32 },
    Halted,
    Panicked { code: u32 },
    Suspended,
    Resumed,
    Service(SrvMsg),
    HostPanicBit(IrqTarget),
}

struct Regs {
    pending: u16,
    masked: u16,
    fromhost: [u16; 2],
    mailboxes: Vec<u32>,
    irq_handler: Option<MifIrqHandler>,
    reset_handler: Option<ResetRequestHandler>,
    mapped: bool,
    in_reset: bool,
}

struct Firmware {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    id: ThreadId,
}

struct SimInner {
    me: Weak<SimInner>,
    mem: HeapRegion,
    regs: Mutex<Regs>,
    doorbell: Condvar,
    behaviour: Mutex<SimBehaviour>,
    firmware: Mutex<Option<Firmware>>,
    events: Mutex<Vec<SimEvent>>,
    boots: AtomicU32,
}

/// Simulated shared-memory interface.
#[derive(Clone)]
pub struct SimMif {
    inner: Arc<SimInner>,
}

impl SimMif {
    pub fn new(size: usize) -> Self {
        let inner = Arc::new_cyclic(|me| SimInner {
            me: me.clone(),
            mem: HeapRegion::new_zeroed(size),
            regs: Mutex::new(Regs {
                pending: 0,
                masked: 0xffff,
                fromhost: [0; 2],
                mailboxes: vec![0; SIM_MAILBOXES as usize],
                irq_handler: None,
                reset_handler: None,
                mapped: false,
                in_reset: true,
            }),
            doorbell: Condvar::new(),
            behaviour: Mutex::new(SimBehaviour::default()),
            firmware: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            boots: AtomicU32::new(0),
        });
        Self { inner }
    }

    pub fn hal(&self) -> Arc<dyn MifHal> {
        self.inner.clone()
    }

    pub fn region(&self) -> Region {
        self.inner.mem.region()
    }

    pub fn set_behaviour(&self, behaviour: SimBehaviour) {
        *self.inner.behaviour.lock() = behaviour;
    }

    /// Raise a to-host bit as the firmware would.
    pub fn raise_tohost(&self, bit: u8) {
        self.inner.raise_tohost(bit);
    }

    /// Crash the firmware with `code`: write panic records and ask for reset.
    pub fn raise_panic(&self, code: u32) {
        self.inner.panic(code);
    }

    /// Flip every bit of the byte at `offset` in shared RAM.
    pub fn corrupt(&self, offset: u32) {
        let region = self.inner.mem.region();
        let mut byte = [0u8];
        let at = MifRamRef::new(offset);
        if region.read_bytes(at, &mut byte).is_ok() {
            byte[0] ^= 0xff;
            let _ = region.write_bytes(at, &byte);
        }
    }

    pub fn mailbox(&self, index: u32) -> u32 {
        self.inner.mailbox_read(index)
    }

    pub fn is_in_reset(&self) -> bool {
        self.inner.regs.lock().in_reset
    }

    pub fn is_mapped(&self) -> bool {
        self.inner.regs.lock().mapped
    }

    pub fn has_irq_handler(&self) -> bool {
        self.inner.regs.lock().irq_handler.is_some()
    }

    /// Number of times reset was released.
    pub fn boots(&self) -> u32 {
        self.inner.boots.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.inner.events.lock().clone()
    }
}

impl SimInner {
    fn record(&self, event: SimEvent) {
        trace!(?event, "sim event");
        self.events.lock().push(event);
    }

    fn raise_tohost(&self, bit: u8) {
        let handler = {
            let mut regs = self.regs.lock();
            regs.pending |= 1 << bit;
            if regs.masked & (1 << bit) != 0 {
                return;
            }
            regs.irq_handler.clone()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    fn panic(&self, code: u32) {
        let region = self.mem.region();
        for (i, offset) in SIM_PANIC_RECORD_OFFSETS.iter().enumerate() {
            let record = PanicRecord {
                full_panic_code: code,
                registers: core::array::from_fn(|r| ((i as u32) << 16) | r as u32),
            };
            if let Err(e) = record.write(&region, MifRamRef::new(*offset)) {
                warn!(error = %e, "sim: could not write panic record");
            }
        }
        self.record(SimEvent::Panicked { code });
        info!(code = %format_args!("{code:#x}"), "sim: firmware panicked");

        if let Some(fw) = self.firmware.lock().as_ref() {
            fw.stop.store(true, Ordering::Release);
        }
        self.doorbell.notify_all();
        let handler = self.regs.lock().reset_handler.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn start_firmware(&self) -> io::Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let me = self.me.clone();
        let stop2 = stop.clone();
        let handle = thread::Builder::new()
            .name("simfw".into())
            .spawn(move || run_firmware(me, stop2))?;
        let id = handle.thread().id();
        *self.firmware.lock() = Some(Firmware { stop, handle, id });
        Ok(())
    }

    fn stop_firmware(&self) {
        let Some(fw) = self.firmware.lock().take() else {
            return;
        };
        fw.stop.store(true, Ordering::Release);
        self.doorbell.notify_all();
        if thread::current().id() != fw.id && fw.handle.join().is_err() {
            warn!("simfw thread panicked");
        }
    }
}

impl MifHal for SimInner {
    fn map(&self) -> io::Result<Region> {
        self.regs.lock().mapped = true;
        Ok(self.mem.region())
    }

    fn unmap(&self) {
        self.regs.lock().mapped = false;
    }

    fn reset(&self, assert: bool) -> io::Result<()> {
        if assert {
            self.regs.lock().in_reset = true;
            self.stop_firmware();
            return Ok(());
        }
        {
            let mut regs = self.regs.lock();
            if !regs.in_reset {
                return Ok(());
            }
            regs.in_reset = false;
            regs.fromhost = [0; 2];
        }
        self.boots.fetch_add(1, Ordering::Relaxed);
        self.start_firmware()
    }

    fn irq_pending(&self) -> u16 {
        let regs = self.regs.lock();
        regs.pending & !regs.masked
    }

    fn irq_bit_clear(&self, bit: u8) {
        self.regs.lock().pending &= !(1 << bit);
    }

    fn irq_bit_mask(&self, bit: u8) {
        self.regs.lock().masked |= 1 << bit;
    }

    fn irq_bit_unmask(&self, bit: u8) {
        self.regs.lock().masked &= !(1 << bit);
    }

    fn irq_bit_set(&self, bit: u8, target: IrqTarget) {
        debug_assert!(bit < IRQ_BIT_COUNT);
        self.regs.lock().fromhost[target.index()] |= 1 << bit;
        self.doorbell.notify_all();
    }

    fn register_irq_handler(&self, handler: MifIrqHandler) {
        self.regs.lock().irq_handler = Some(handler);
    }

    fn unregister_irq_handler(&self) {
        self.regs.lock().irq_handler = None;
    }

    fn register_reset_request_handler(&self, handler: ResetRequestHandler) {
        self.regs.lock().reset_handler = Some(handler);
    }

    fn unregister_reset_request_handler(&self) {
        self.regs.lock().reset_handler = None;
    }

    fn mailbox_count(&self) -> u32 {
        SIM_MAILBOXES
    }

    fn mailbox_read(&self, index: u32) -> u32 {
        self.regs
            .lock()
            .mailboxes
            .get(index as usize)
            .copied()
            .unwrap_or(0)
    }

    fn mailbox_write(&self, index: u32, value: u32) {
        if let Some(slot) = self.regs.lock().mailboxes.get_mut(index as usize) {
            *slot = value;
        }
    }
}

/// One ring pair as seen from the firmware side.
struct FwLink {
    /// Firmware writes, host reads.
    tx: PacketRing,
    tx_bit: u8,
    /// Host writes, firmware reads.
    rx: PacketRing,
    rx_freed_bit: u8,
}

impl FwLink {
    fn attach(region: Region, to_host: &StreamConf, from_host: &StreamConf) -> Option<Self> {
        // SAFETY: the host initialised both rings before publishing the record.
        let tx = unsafe { PacketRing::attach(region, to_host.ring_layout()) };
        let rx = unsafe { PacketRing::attach(region, from_host.ring_layout()) };
        match (tx, rx) {
            (Ok(tx), Ok(rx)) => Some(Self {
                tx,
                tx_bit: to_host.read_bit as u8,
                rx,
                rx_freed_bit: from_host.write_bit as u8,
            }),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "sim: bad ring in mxconf");
                None
            }
        }
    }
}

struct FwLinks {
    mgmt: FwLink,
    debug: [FwLink; 2],
}

enum Flow {
    Continue,
    Stop,
}

fn run_firmware(weak: Weak<SimInner>, stop: Arc<AtomicBool>) {
    let Some(links) = weak.upgrade().and_then(|sim| handshake(&sim)) else {
        return;
    };

    loop {
        let Some(sim) = weak.upgrade() else {
            break;
        };
        if stop.load(Ordering::Acquire) {
            break;
        }
        let fromhost = {
            let mut regs = sim.regs.lock();
            if regs.fromhost == [0; 2] {
                sim.doorbell.wait_for(&mut regs, POLL);
            }
            std::mem::take(&mut regs.fromhost)
        };
        if stop.load(Ordering::Acquire) {
            break;
        }
        for target in IrqTarget::ALL {
            if fromhost[target.index()] & (1 << PANIC_FROMHOST_BIT) != 0 {
                sim.record(SimEvent::HostPanicBit(target));
            }
        }
        if let Flow::Stop = service_links(&sim, &links) {
            break;
        }
    }
    debug!("simfw: exiting");
}

fn handshake(sim: &SimInner) -> Option<FwLinks> {
    let region = sim.mem.region();
    let magic = sim.mailbox_read(MBOX_MAGIC);
    if magic != MXCONF_MAGIC {
        error!(magic = %format_args!("{magic:#x}"), "sim: no mxconf magic in mailbox");
        return None;
    }
    let at = MifRamRef::new(sim.mailbox_read(MBOX_MXCONF));
    // SAFETY: MxConf is plain u32 fields.
    let conf: MxConf = match unsafe { region.read_value(at) } {
        Ok(conf) => conf,
        Err(e) => {
            error!(error = %e, "sim: mxconf out of bounds");
            return None;
        }
    };
    if conf.magic != MXCONF_MAGIC {
        error!("sim: mxconf record has bad magic");
        return None;
    }

    let links = FwLinks {
        mgmt: FwLink::attach(region, &conf.mgmt.to_host, &conf.mgmt.from_host)?,
        debug: [
            FwLink::attach(region, &conf.debug_r4.to_host, &conf.debug_r4.from_host)?,
            FwLink::attach(region, &conf.debug_m4.to_host, &conf.debug_m4.from_host)?,
        ],
    };

    let behaviour = *sim.behaviour.lock();
    sim.record(SimEvent::Booted {
        startup_flags: conf.startup_flags,
    });
    if behaviour.boot_ack {
        send_mgmt(sim, &links.mgmt, ChannelId::Logging, b"hello");
        send_mgmt(
            sim,
            &links.mgmt,
            ChannelId::Management,
            &[MgmtVerb::StartIndication as u8],
        );
    }
    Some(links)
}

fn send_mgmt(sim: &SimInner, link: &FwLink, channel: ChannelId, payload: &[u8]) {
    let mut packet = [0u8; MGMT_PACKET_SIZE as usize];
    let n = payload.len().min(MGMT_PAYLOAD_MAX);
    packet[0] = channel as u8;
    packet[1..1 + n].copy_from_slice(&payload[..n]);
    if !link.tx.write(&packet) {
        warn!(?channel, "sim: to-host management ring full");
        return;
    }
    sim.raise_tohost(link.tx_bit);
}

fn service_links(sim: &SimInner, links: &FwLinks) -> Flow {
    let behaviour = *sim.behaviour.lock();
    let mut flow = Flow::Continue;

    let mut consumed = false;
    while let Some(slot) = links.mgmt.rx.peek(None) {
        let packet: [u8; MGMT_PACKET_SIZE as usize] = match slot.data().try_into() {
            Ok(p) => p,
            Err(_) => break,
        };
        links.mgmt.rx.peek_complete(slot.index());
        consumed = true;
        if let Flow::Stop = handle_packet(sim, links, &packet, behaviour) {
            flow = Flow::Stop;
            break;
        }
    }
    if consumed {
        sim.raise_tohost(links.mgmt.rx_freed_bit);
    }
    if let Flow::Stop = flow {
        return flow;
    }

    for link in &links.debug {
        let mut buf = vec![0u8; link.rx.slot_count() as usize * link.rx.slot_size() as usize];
        let n = link.rx.read(&mut buf);
        if n == 0 {
            continue;
        }
        sim.raise_tohost(link.rx_freed_bit);
        if link.tx.write(&buf[..n]) {
            sim.raise_tohost(link.tx_bit);
        } else {
            warn!(bytes = n, "sim: debug echo dropped");
        }
    }
    Flow::Continue
}

fn handle_packet(
    sim: &SimInner,
    links: &FwLinks,
    packet: &[u8; MGMT_PACKET_SIZE as usize],
    behaviour: SimBehaviour,
) -> Flow {
    let payload = &packet[1..];
    match ChannelId::from_u8(packet[0]) {
        Some(ChannelId::Management) => match MgmtVerb::from_u8(payload[0]) {
            Some(MgmtVerb::HaltRequest) => {
                sim.record(SimEvent::Halted);
                if behaviour.halt_ack {
                    send_mgmt(
                        sim,
                        &links.mgmt,
                        ChannelId::Management,
                        &[MgmtVerb::HaltRequest as u8],
                    );
                }
                return Flow::Stop;
            }
            Some(MgmtVerb::ForcePanic) => {
                sim.panic(SIM_FORCED_PANIC_CODE);
                return Flow::Stop;
            }
            Some(MgmtVerb::Suspend) => sim.record(SimEvent::Suspended),
            Some(MgmtVerb::Resume) => sim.record(SimEvent::Resumed),
            Some(MgmtVerb::StartIndication) | None => {
                warn!(verb = payload[0], "sim: unexpected management verb");
            }
        },
        Some(ChannelId::ServiceManagement) => match SrvMsg::decode(payload) {
            Ok(msg) => {
                sim.record(SimEvent::Service(msg));
                if behaviour.confirm_services
                    && let Some(verb) = msg.verb.confirm()
                {
                    let reply = SrvMsg { verb, ..msg };
                    send_mgmt(
                        sim,
                        &links.mgmt,
                        ChannelId::ServiceManagement,
                        &reply.encode(),
                    );
                }
            }
            Err(e) => warn!(error = %e, "sim: bad service message"),
        },
        Some(ChannelId::Logging) | None => {
            warn!(channel = packet[0], "sim: unexpected channel from host");
        }
    }
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_bits_stay_pending() {
        let sim = SimMif::new(4096);
        let hal = sim.hal();
        sim.raise_tohost(3);
        assert_eq!(hal.irq_pending(), 0);
        hal.irq_bit_unmask(3);
        assert_eq!(hal.irq_pending(), 1 << 3);
        hal.irq_bit_clear(3);
        assert_eq!(hal.irq_pending(), 0);
    }

    #[test]
    fn firmware_without_handshake_exits() {
        let sim = SimMif::new(64 * 1024);
        let hal = sim.hal();
        hal.reset(false).unwrap();
        assert!(!sim.is_in_reset());
        assert_eq!(sim.boots(), 1);
        hal.reset(true).unwrap();
        assert!(sim.is_in_reset());
        assert!(sim.events().is_empty());
    }

    #[test]
    fn panic_writes_records_and_requests_reset() {
        let sim = SimMif::new(64 * 1024);
        let hal = sim.hal();
        let requested = Arc::new(AtomicBool::new(false));
        let flag = requested.clone();
        hal.register_reset_request_handler(Arc::new(move || flag.store(true, Ordering::SeqCst)));

        sim.raise_panic(0x42);
        assert!(requested.load(Ordering::SeqCst));
        let record =
            PanicRecord::read(&sim.region(), MifRamRef::new(SIM_PANIC_RECORD_OFFSETS[1])).unwrap();
        assert_eq!(record.full_panic_code, 0x42);
        assert_eq!(sim.events(), vec![SimEvent::Panicked { code: 0x42 }]);
    }
}
