mod support;

use std::time::Duration;

use mx_supervisor::fwimage::FW_HEADER_MIN_LEN;
use mx_supervisor::mxconf::MXCONF_MAGIC;
use mx_supervisor::sim::{SimBehaviour, SimEvent, SimMif, sim_image};
use mx_supervisor::{FileFirmware, Mx, MxConfig, MxError, MxState, StaticFirmware};
use support::*;

#[test]
fn second_open_reuses_the_running_firmware() {
    let Rig { sim, mx } = rig(config());
    let log = log();

    let a = mx.open_service(1, Recorder::new(1, &log)).unwrap();
    let b = mx.open_service(2, Recorder::new(2, &log)).unwrap();
    assert_eq!(mx.state(), MxState::Started);
    assert_eq!(mx.users(), 2);
    assert_eq!(mx.boot_count(), 1);
    assert_eq!(sim.boots(), 1);

    assert_eq!(sim.mailbox(0), FW_HEADER_MIN_LEN);
    assert_eq!(sim.mailbox(2), MXCONF_MAGIC);
    assert!(
        sim.events()
            .contains(&SimEvent::Booted { startup_flags: 0 })
    );

    a.close().unwrap();
    assert_eq!(mx.state(), MxState::Started);
    assert_eq!(mx.users(), 1);

    b.close().unwrap();
    assert_eq!(mx.state(), MxState::Stopped);
    assert_eq!(mx.users(), 0);
    assert!(sim.events().contains(&SimEvent::Halted));
    assert!(sim.is_in_reset());
    assert!(!sim.is_mapped());
    assert!(!sim.has_irq_handler());
    assert!(log.lock().is_empty());
}

#[test]
fn reopen_after_stop_boots_again() {
    let Rig { sim, mx } = rig(config());
    let log = log();

    drop(mx.open_service(1, Recorder::new(1, &log)).unwrap());
    assert_eq!(mx.state(), MxState::Stopped);
    let s = mx.open_service(1, Recorder::new(1, &log)).unwrap();
    assert_eq!(mx.boot_count(), 2);
    assert_eq!(sim.boots(), 2);
    s.close().unwrap();
}

#[test]
fn validation_failure_leaves_everything_released() {
    let mut image = sim_image();
    image[20] ^= 0x40;
    let Rig { sim, mx } = rig_with_image(config(), image);
    let log = log();

    let err = mx.open_service(1, Recorder::new(1, &log)).err().unwrap();
    assert!(matches!(err, MxError::ValidationFailed(_)), "{err}");
    assert_eq!(mx.state(), MxState::Stopped);
    assert_eq!(mx.users(), 0);
    assert_eq!(mx.service_count(), 0);
    assert_eq!(sim.boots(), 0);
    assert!(sim.is_in_reset());
    assert!(!sim.is_mapped());
    assert!(!sim.has_irq_handler());
}

#[test]
fn missing_start_indication_times_out() {
    let cfg = MxConfig {
        boot_timeout: Duration::from_millis(200),
        ..config()
    };
    let Rig { sim, mx } = rig(cfg);
    sim.set_behaviour(SimBehaviour {
        boot_ack: false,
        ..SimBehaviour::default()
    });

    let err = mx.open_service(1, Recorder::new(1, &log())).err().unwrap();
    assert!(matches!(err, MxError::Timeout(_)), "{err}");
    assert_eq!(mx.state(), MxState::Stopped);
    assert!(sim.is_in_reset());
    assert!(!sim.is_mapped());

    // The firmware behaves on the next attempt.
    sim.set_behaviour(SimBehaviour::default());
    let s = mx.open_service(1, Recorder::new(1, &log())).unwrap();
    assert_eq!(mx.boot_count(), 1);
    s.close().unwrap();
}

#[test]
fn silent_halt_still_stops() {
    let cfg = MxConfig {
        halt_timeout: Duration::from_millis(100),
        ..config()
    };
    let Rig { sim, mx } = rig(cfg);
    sim.set_behaviour(SimBehaviour {
        halt_ack: false,
        ..SimBehaviour::default()
    });

    let s = mx.open_service(1, Recorder::new(1, &log())).unwrap();
    s.close().unwrap();
    assert_eq!(mx.state(), MxState::Stopped);
    assert!(sim.events().contains(&SimEvent::Halted));
}

#[test]
fn duplicate_service_id_is_rejected() {
    let Rig { mx, .. } = rig(config());
    let log = log();

    let s = mx.open_service(5, Recorder::new(5, &log)).unwrap();
    let err = mx.open_service(5, Recorder::new(5, &log)).err().unwrap();
    assert!(matches!(err, MxError::AlreadyInProgress));
    assert_eq!(mx.users(), 1);
    s.close().unwrap();
}

#[test]
fn close_without_users_is_not_found() {
    let Rig { mx, .. } = rig(config());
    assert!(matches!(mx.manager().close(), Err(MxError::NotFound)));
}

#[test]
fn firmware_from_disk() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mx.bin");
    std::fs::write(&path, sim_image()).unwrap();

    let sim = SimMif::new(SHARED_RAM);
    let mx = Mx::new(sim.hal(), Box::new(FileFirmware::new(&path)), config()).unwrap();
    let s = mx.open_service(1, Recorder::new(1, &log())).unwrap();
    assert_eq!(mx.state(), MxState::Started);
    s.close().unwrap();

    let sim = SimMif::new(SHARED_RAM);
    let mx = Mx::new(
        sim.hal(),
        Box::new(FileFirmware::new(dir.path().join("absent.bin"))),
        config(),
    )
    .unwrap();
    let err = mx.open_service(1, Recorder::new(1, &log())).err().unwrap();
    assert!(matches!(err, MxError::Io(_)), "{err}");
    assert_eq!(mx.state(), MxState::Stopped);
    assert!(!sim.is_mapped());
}

#[test]
fn invalid_config_is_refused() {
    let sim = SimMif::new(SHARED_RAM);
    let cfg = MxConfig {
        debug_slot_size: 3,
        ..config()
    };
    let err = Mx::new(sim.hal(), Box::new(StaticFirmware(sim_image())), cfg)
        .err()
        .unwrap();
    assert!(matches!(err, MxError::InvalidState(_)));
}

#[test]
fn startup_flags_reach_the_firmware() {
    let cfg = MxConfig {
        startup_flags: 0x11,
        ..config()
    };
    let Rig { sim, mx } = rig(cfg);
    let s = mx.open_service(1, Recorder::new(1, &log())).unwrap();
    assert_eq!(sim.mailbox(3), 0x11);
    assert!(
        sim.events()
            .contains(&SimEvent::Booted { startup_flags: 0x11 })
    );
    s.close().unwrap();
}
