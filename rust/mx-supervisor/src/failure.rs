//! The `mxfail` worker: everything that happens after `fail` or `freeze`.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RecoveryPolicy;
use crate::manager::{FailureCause, FailureJob, MxState};
use crate::{Mx, MxShared};

pub(crate) fn spawn(
    shared: Weak<MxShared>,
    mut rx: mpsc::UnboundedReceiver<FailureJob>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("mxfail".into()).spawn(move || {
        while let Some(job) = rx.blocking_recv() {
            match job {
                FailureJob::Process => {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    process(&shared);
                }
                FailureJob::Shutdown => break,
            }
        }
        debug!("mxfail: exiting");
    })
}

fn process(shared: &Arc<MxShared>) {
    let man = &shared.man;

    man.transport_errored.store(true, Ordering::Release);
    shared.srvman.set_error(true);

    // Nothing that is waiting can be answered any more.
    man.abort_waits();
    shared.srvman.abort_waits();

    man.raise_panic_bits();

    let services = shared.srvman.snapshot();

    let report = {
        let guard = man.lock_state();
        let Some(pending) = man.enter_pending(&guard) else {
            // Closed before the job ran.
            if man.state() == MxState::Stopped {
                shared.srvman.set_error(false);
            }
            return;
        };

        shared.srvman.freeze_services(&services);

        if pending.next == MxState::Freezed {
            info!("services frozen");
            return;
        }
        let report = man.collect_panic(&guard, pending.cause);
        if let FailureCause::Host(_) = pending.cause {
            warn!(code = %report.code, "host-declared failure");
        } else {
            warn!(
                code = %report.code,
                records = report.records.len(),
                "firmware panic"
            );
        }
        report
    };

    match man.config().recovery {
        RecoveryPolicy::AutoRecover => {
            info!(code = %report.code, "recovering");
            shared.srvman.set_error(false);
            shared.srvman.unfreeze_services(report.code);
            let mx = Mx {
                shared: shared.clone(),
            };
            shared.clients.recover(&mx);
        }
        RecoveryPolicy::StayFailed => {
            info!("recovery disabled, staying failed until the last close");
        }
    }
}
