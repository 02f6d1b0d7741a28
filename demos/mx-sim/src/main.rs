//! Simulated coprocessor walkthrough
//!
//! Boots the in-memory firmware model behind the supervisor, runs one
//! service through a start/stop handshake, forces a firmware panic and
//! watches the client driver come back after recovery.
//!
//! ## Running
//!
//! ```bash
//! RUST_LOG=debug cargo run -p mx-sim
//! ```

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mx_supervisor::sim::{SimMif, sim_image};
use mx_supervisor::{
    Mx, MxClient, MxConfig, MxError, MxState, PanicCode, ProbeReason, Service, ServiceClient,
    StaticFirmware,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const WLAN: u8 = 1;

struct WlanCallbacks;

impl ServiceClient for WlanCallbacks {
    fn stop_on_failure(&self) {
        warn!("wlan: coprocessor failed, stopping traffic");
    }

    fn failure_reset(&self, code: PanicCode) {
        info!(%code, "wlan: coprocessor is being reset");
    }
}

/// Opens the wlan service on probe and closes it on remove.
struct WlanDriver {
    service: parking_lot::Mutex<Option<Service>>,
}

impl WlanDriver {
    fn bring_up(&self, mx: &Mx) -> Result<(), MxError> {
        let service = mx.open_service(WLAN, Arc::new(WlanCallbacks))?;
        let config = service.mifram_alloc_zeroed(256, 64)?;
        service.start(config)?;
        info!(%config, "wlan: started");
        *self.service.lock() = Some(service);
        Ok(())
    }
}

impl MxClient for WlanDriver {
    fn name(&self) -> &str {
        "wlan"
    }

    fn probe(&self, mx: &Mx, reason: ProbeReason) {
        info!(?reason, "wlan: probe");
        if let Err(e) = self.bring_up(mx) {
            warn!(error = %e, "wlan: bring-up failed");
        }
    }

    fn remove(&self, _mx: &Mx, reason: ProbeReason) {
        info!(?reason, "wlan: remove");
        if let Some(service) = self.service.lock().take() {
            // A failed coprocessor cannot confirm the stop.
            if reason == ProbeReason::Registration
                && let Err(e) = service.stop()
            {
                warn!(error = %e, "wlan: stop failed");
            }
            if let Err(e) = service.close() {
                warn!(error = %e, "wlan: close failed");
            }
        }
    }
}

fn wait_for(mx: &Mx, what: &str, cond: impl Fn(&Mx) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond(mx) {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    warn!(what, "gave up waiting");
    false
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mx::fw=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let sim = SimMif::new(1024 * 1024);
    let mx = Mx::new(
        sim.hal(),
        Box::new(StaticFirmware(sim_image())),
        MxConfig::default(),
    )?;

    let driver: Arc<dyn MxClient> = Arc::new(WlanDriver {
        service: parking_lot::Mutex::new(None),
    });
    mx.register_client(driver.clone());
    info!(state = ?mx.state(), boots = mx.boot_count(), "after registration");

    mx.force_panic()?;
    wait_for(&mx, "recovery", |mx| {
        mx.boot_count() == 2 && mx.state() == MxState::Started
    });
    if let Some(report) = mx.last_panic() {
        info!(code = %report.code, records = report.records.len(), "last panic");
        for (core, record) in &report.records {
            info!(core = core.name(), pc = %format_args!("{:#x}", record.registers[15]), "panic record");
        }
    }

    mx.unregister_client(&driver)?;
    info!(state = ?mx.state(), events = sim.events().len(), "done");
    Ok(())
}
