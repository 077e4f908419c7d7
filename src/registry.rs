//! Thread-safe registry of active client connections.
//!
//! The registry tracks membership only; each handle owns its socket. It
//! subscribes to every registered handle's disconnect notification so a
//! handle torn down by any trigger is removed exactly once, and there is no
//! process-wide singleton: callers construct a registry and share clones.

use std::sync::{Arc, Weak};

use tracing::{info, warn};

use crate::client::{allocate_observer_key, ClientHandle};
use crate::sync::GuardedList;

#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    /// Identity key for this registry's disconnect subscriptions.
    observer_key: u64,
    clients: GuardedList<Arc<ClientHandle>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                observer_key: allocate_observer_key(),
                clients: GuardedList::new(),
            }),
        }
    }

    /// Add a handle and subscribe to its disconnect notification. Returns
    /// false if the handle is already present or already disconnecting.
    pub fn register(&self, client: &Arc<ClientHandle>) -> bool {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let subscribed = client.subscribe_disconnect(
            self.inner.observer_key,
            Box::new(move |handle| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_client_disconnected(handle);
                }
            }),
        );
        if !subscribed {
            return false;
        }

        let id = client.id();
        if !self
            .inner
            .clients
            .push_if_absent(Arc::clone(client), move |c| c.id() == id)
        {
            return false;
        }

        // The disconnect notification may have fired between the subscribe
        // and the insert; a handle that slipped in dead is removed here.
        if client.is_disconnecting() {
            self.inner.clients.remove_where(|c| c.id() == id);
            return false;
        }
        true
    }

    /// Remove a handle and drop the disconnect subscription. Returns whether
    /// the handle was present.
    pub fn unregister(&self, client: &Arc<ClientHandle>) -> bool {
        let removed = self
            .inner
            .clients
            .remove_where(|c| c.id() == client.id())
            .is_some();
        if removed {
            client.unsubscribe_disconnect(self.inner.observer_key);
        }
        removed
    }

    /// Point-in-time copy of the membership, in registration order. Safe to
    /// iterate without any lock; handles may still disconnect between
    /// snapshot time and use time.
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.inner.clients.snapshot()
    }

    pub fn find(&self, id: u64) -> Option<Arc<ClientHandle>> {
        self.inner.clients.find(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    /// Deliver one line to every handle still reporting connected. A failure
    /// on one handle is logged and does not abort delivery to the rest.
    pub async fn broadcast(&self, message: &str) {
        for client in self.snapshot() {
            if !client.is_connected() {
                continue;
            }
            if let Err(e) = client.write_line(message).await {
                warn!(client = %client, error = %e, "broadcast delivery failed");
            }
        }
    }

    /// Human-readable listing of the connected clients.
    pub fn roster(&self) -> String {
        let clients = self.snapshot();
        let mut out = format!("Total clients online: {}\n", clients.len());
        for client in &clients {
            out.push_str(&format!(
                "{} from {} -- {}\n",
                client.name(),
                client.addr(),
                client.host()
            ));
        }
        out
    }
}

impl RegistryInner {
    fn on_client_disconnected(&self, client: &ClientHandle) {
        if self
            .clients
            .remove_where(|c| c.id() == client.id())
            .is_some()
        {
            info!(client = %client, "removed disconnected client from registry");
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
