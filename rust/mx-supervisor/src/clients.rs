//! Client drivers that sit on top of the supervisor.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::Mx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReason {
    /// The client was just registered.
    Registration,
    /// The coprocessor is coming back after a failure.
    Recovery,
}

/// A driver that opens services. `remove` must close every service the
/// client holds; `probe` may reopen them.
pub trait MxClient: Send + Sync {
    fn name(&self) -> &str;
    fn probe(&self, mx: &Mx, reason: ProbeReason);
    fn remove(&self, mx: &Mx, reason: ProbeReason);
}

#[derive(Default)]
pub(crate) struct ClientRegistry {
    clients: Mutex<Vec<Arc<dyn MxClient>>>,
}

impl ClientRegistry {
    pub(crate) fn register(&self, mx: &Mx, client: Arc<dyn MxClient>) {
        self.clients.lock().push(client.clone());
        info!(client = client.name(), "client registered");
        client.probe(mx, ProbeReason::Registration);
    }

    pub(crate) fn unregister(&self, mx: &Mx, client: &Arc<dyn MxClient>) -> bool {
        let removed = {
            let mut clients = self.clients.lock();
            let before = clients.len();
            clients.retain(|c| !Arc::ptr_eq(c, client));
            clients.len() != before
        };
        if removed {
            client.remove(mx, ProbeReason::Registration);
            info!(client = client.name(), "client unregistered");
        }
        removed
    }

    /// Remove every client, then probe them all again.
    pub(crate) fn recover(&self, mx: &Mx) {
        let clients = self.clients.lock().clone();
        for client in &clients {
            debug!(client = client.name(), "remove for recovery");
            client.remove(mx, ProbeReason::Recovery);
        }
        for client in &clients {
            debug!(client = client.name(), "probe for recovery");
            client.probe(mx, ProbeReason::Recovery);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.lock().len()
    }
}
