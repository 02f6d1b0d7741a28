//! Shared rig for the integration suites: a simulated MIF with the sim
//! firmware image, plus recording clients.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use mx_supervisor::sim::{SimMif, sim_image};
use mx_supervisor::{
    Mx, MxClient, MxConfig, PanicCode, ProbeReason, RecoveryPolicy, Service, ServiceClient,
    ServiceId, StaticFirmware,
};
use parking_lot::Mutex;

pub const SHARED_RAM: usize = 1024 * 1024;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn config() -> MxConfig {
    MxConfig {
        boot_timeout: Duration::from_secs(2),
        halt_timeout: Duration::from_millis(300),
        service_timeout: Duration::from_secs(1),
        recovery_timeout: Duration::from_secs(5),
        crc_check_interval: None,
        ..MxConfig::default()
    }
}

pub fn stay_failed() -> MxConfig {
    MxConfig {
        recovery: RecoveryPolicy::StayFailed,
        ..config()
    }
}

pub struct Rig {
    pub sim: SimMif,
    pub mx: Mx,
}

pub fn rig(config: MxConfig) -> Rig {
    rig_with_image(config, sim_image())
}

pub fn rig_with_image(config: MxConfig, image: Vec<u8>) -> Rig {
    init_tracing();
    let sim = SimMif::new(SHARED_RAM);
    let mx = Mx::new(sim.hal(), Box::new(StaticFirmware(image)), config).unwrap();
    Rig { sim, mx }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// Records failure callbacks for one service.
pub struct Recorder {
    pub id: ServiceId,
    pub log: Log,
}

impl Recorder {
    pub fn new(id: ServiceId, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            id,
            log: log.clone(),
        })
    }
}

impl ServiceClient for Recorder {
    fn stop_on_failure(&self) {
        self.log.lock().push(format!("stop {}", self.id));
    }

    fn failure_reset(&self, code: PanicCode) {
        self.log.lock().push(format!("reset {} {code}", self.id));
    }
}

/// A client driver owning one service, opened on probe and closed on remove.
pub struct OneServiceClient {
    pub name: String,
    pub id: ServiceId,
    pub log: Log,
    pub service: Mutex<Option<Service>>,
}

impl OneServiceClient {
    pub fn new(name: &str, id: ServiceId, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            id,
            log: log.clone(),
            service: Mutex::new(None),
        })
    }
}

impl MxClient for OneServiceClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self, mx: &Mx, reason: ProbeReason) {
        self.log.lock().push(format!("probe {} {reason:?}", self.name));
        match mx.open_service(self.id, Recorder::new(self.id, &self.log)) {
            Ok(service) => *self.service.lock() = Some(service),
            Err(e) => self.log.lock().push(format!("open failed {e}")),
        }
    }

    fn remove(&self, _mx: &Mx, reason: ProbeReason) {
        self.log.lock().push(format!("remove {} {reason:?}", self.name));
        if let Some(service) = self.service.lock().take() {
            service.close().unwrap();
        }
    }
}
