mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use mif_primitives::MifRamRef;
use mx_supervisor::intrbit::IntrBits;
use mx_supervisor::mbox::MBOX_RESERVED;
use mx_supervisor::msg::{ChannelId, MgmtVerb, SrvMsg, SrvVerb};
use mx_supervisor::sim::{SimBehaviour, SimEvent};
use mx_supervisor::{IrqTarget, MxConfig, MxError, MxState, PanicCode};
use support::*;

#[test]
fn start_and_stop_are_confirmed() {
    let Rig { sim, mx } = rig(config());
    let s = mx.open_service(7, Recorder::new(7, &log())).unwrap();

    s.start(MifRamRef::new(0x1234)).unwrap();
    s.stop().unwrap();

    let requests: Vec<SrvMsg> = sim
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::Service(msg) => Some(msg),
            _ => None,
        })
        .collect();
    assert_eq!(
        requests,
        vec![
            SrvMsg {
                service_id: 7,
                verb: SrvVerb::StartReq,
                data: 0x1234,
            },
            SrvMsg {
                service_id: 7,
                verb: SrvVerb::StopReq,
                data: 0,
            },
        ]
    );
    s.close().unwrap();
}

#[test]
fn confirms_are_routed_by_service_id() {
    let Rig { mx, .. } = rig(config());
    let a = Arc::new(mx.open_service(1, Recorder::new(1, &log())).unwrap());
    let b = Arc::new(mx.open_service(2, Recorder::new(2, &log())).unwrap());

    thread::scope(|scope| {
        for s in [&a, &b] {
            scope.spawn(move || {
                for _ in 0..10 {
                    s.start(MifRamRef::new(0)).unwrap();
                    s.stop().unwrap();
                }
            });
        }
    });
}

#[test]
fn unconfirmed_request_times_out() {
    let cfg = MxConfig {
        service_timeout: Duration::from_millis(150),
        ..config()
    };
    let Rig { sim, mx } = rig(cfg);
    sim.set_behaviour(SimBehaviour {
        confirm_services: false,
        ..SimBehaviour::default()
    });
    let s = mx.open_service(3, Recorder::new(3, &log())).unwrap();

    let err = s.start(MifRamRef::new(0)).err().unwrap();
    assert!(matches!(err, MxError::Timeout(_)), "{err}");

    // The service is usable again once the firmware answers.
    sim.set_behaviour(SimBehaviour::default());
    s.stop().unwrap();
    s.close().unwrap();
}

#[test]
fn overlapping_request_is_busy() {
    let cfg = MxConfig {
        service_timeout: Duration::from_millis(500),
        ..config()
    };
    let Rig { sim, mx } = rig(cfg);
    sim.set_behaviour(SimBehaviour {
        confirm_services: false,
        ..SimBehaviour::default()
    });
    let s = mx.open_service(3, Recorder::new(3, &log())).unwrap();

    thread::scope(|scope| {
        let pending = scope.spawn(|| s.start(MifRamRef::new(0)));
        assert!(wait_until(Duration::from_secs(1), || {
            sim.events()
                .iter()
                .any(|e| matches!(e, SimEvent::Service(_)))
        }));
        assert!(matches!(s.stop(), Err(MxError::Busy)));
        assert!(matches!(pending.join().unwrap(), Err(MxError::Timeout(_))));
    });
}

#[test]
fn requests_fail_fast_after_a_failure() {
    let Rig { mx, .. } = rig(stay_failed());
    let log = log();
    let s = mx.open_service(4, Recorder::new(4, &log)).unwrap();

    s.report_failure(PanicCode::SERVICE_FAILURE);
    assert!(wait_until(Duration::from_secs(2), || log.lock().len() == 1));
    assert!(matches!(s.start(MifRamRef::new(0)), Err(MxError::Io(_))));
    assert!(matches!(s.mifram_alloc(64, 4), Err(MxError::Io(_))));
    assert!(matches!(s.alloc_mboxes(1), Err(MxError::Io(_))));
    assert!(matches!(
        s.alloc_fromhost_irq(IrqTarget::R4),
        Err(MxError::Io(_))
    ));
    assert!(matches!(s.mbox_write(MBOX_RESERVED, 1), Err(MxError::Io(_))));
    s.close().unwrap();
}

#[test]
fn open_racing_the_last_close_still_gets_confirms() {
    let Rig { mx, .. } = rig(config());
    let log = log();

    for round in 0..50 {
        let a = mx.open_service(1, Recorder::new(1, &log)).unwrap();
        let b = thread::scope(|scope| {
            let opener = scope.spawn(|| mx.open_service(2, Recorder::new(2, &log)));
            a.close().unwrap();
            opener.join().unwrap().unwrap()
        });
        if let Err(e) = b.start(MifRamRef::new(0)) {
            panic!("round {round}: {e}");
        }
        b.stop().unwrap();
        b.close().unwrap();
    }
    assert_eq!(mx.state(), MxState::Stopped);
}

#[test]
fn shared_ram_helpers() {
    let Rig { mx, .. } = rig(config());
    let s = mx.open_service(1, Recorder::new(1, &log())).unwrap();

    let r = s.mifram_alloc(1000, 256).unwrap();
    assert!(r.is_aligned(256));
    let ptr = s.ptr_of(r).unwrap();
    assert_eq!(s.ref_of(ptr).unwrap(), r);

    let z = s.mifram_alloc_zeroed(64, 4).unwrap();
    assert_ne!(z, r);
    s.mifram_free(r).unwrap();
    assert!(s.mifram_free(r).is_err());
    s.mifram_free(z).unwrap();
    s.close().unwrap();
}

#[test]
fn interrupt_and_mailbox_helpers() {
    let Rig { sim, mx } = rig(config());
    let s = mx.open_service(1, Recorder::new(1, &log())).unwrap();

    let hits = Arc::new(AtomicU32::new(0));
    let counter = hits.clone();
    let bit = s
        .register_tohost_irq(Arc::new(move |intr: &IntrBits, bit: u8| {
            intr.clear(bit);
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    sim.raise_tohost(bit);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    s.mask_irq(bit).unwrap();
    sim.raise_tohost(bit);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    s.clear_irq(bit).unwrap();
    s.unmask_irq(bit).unwrap();
    s.unregister_tohost_irq(bit).unwrap();
    assert!(matches!(s.unregister_tohost_irq(bit), Err(MxError::NotFound)));

    let fromhost = s.alloc_fromhost_irq(IrqTarget::M4).unwrap();
    assert_ne!(fromhost, 0);
    s.set_irq(fromhost, IrqTarget::M4).unwrap();
    s.free_fromhost_irq(fromhost, IrqTarget::M4).unwrap();

    let first = s.alloc_mboxes(2).unwrap();
    assert!(first >= MBOX_RESERVED);
    s.mbox_write(first + 1, 0xabcd).unwrap();
    assert_eq!(s.mbox_read(first + 1).unwrap(), 0xabcd);
    assert_eq!(sim.mailbox(first + 1), 0xabcd);
    s.free_mboxes(first, 2).unwrap();
    s.close().unwrap();
}

#[test]
fn send_needs_a_running_coprocessor() {
    let Rig { mx, .. } = rig(config());
    let s = mx.open_service(1, Recorder::new(1, &log())).unwrap();
    s.close().unwrap();
    assert!(matches!(
        mx.manager().send(ChannelId::Management, &[MgmtVerb::Suspend as u8]),
        Err(MxError::InvalidState(_))
    ));
}
