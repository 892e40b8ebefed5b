//! # Connection Registry
//!
//! The live connections of a notifier, keyed by remote endpoint. It is the
//! only state shared between connections: an entry is inserted when a
//! connection is accepted and removed when its engine finishes, whatever the
//! reason. Iteration hands out a snapshot, so no lock is held while EIDOs are
//! queued on the engines.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::core::engine::EngineHandle;

/// Live connections by remote endpoint.
#[derive(Debug, Default)]
pub struct Registry {
    connections: Mutex<HashMap<SocketAddr, EngineHandle>>,
    emptied: Notify,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. A stale entry for the same endpoint is replaced and
    /// returned.
    pub fn insert(&self, handle: EngineHandle) -> Option<EngineHandle> {
        let endpoint = handle.peer().endpoint;
        self.lock().insert(endpoint, handle)
    }

    /// Removes the connection at `endpoint` if it is still the one identified
    /// by `connection_id`.
    pub fn remove(&self, endpoint: &SocketAddr, connection_id: u64) -> bool {
        let mut connections = self.lock();
        let removed = match connections.get(endpoint) {
            Some(handle) if handle.connection_id() == connection_id => {
                connections.remove(endpoint);
                true
            }
            _ => false,
        };
        if connections.is_empty() {
            self.emptied.notify_waiters();
        }
        removed
    }

    /// The connections alive right now.
    pub fn snapshot(&self) -> Vec<EngineHandle> {
        self.lock().values().cloned().collect()
    }

    /// The number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether there are no live connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Waits until every connection has been removed, for at most `bound`.
    /// Returns whether the registry emptied in time.
    pub async fn wait_until_empty(&self, bound: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.emptied.notified();
                if self.is_empty() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(bound, drained).await.is_ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, EngineHandle>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::settings::EngineTimings;
    use crate::core::engine::{EngineContext, SubscriptionEngine};
    use crate::core::peer::PeerIdentity;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    fn handle(port: u16) -> EngineHandle {
        let (events, _) = broadcast::channel(4);
        let ctx = EngineContext {
            timings: EngineTimings::default(),
            peer: PeerIdentity::anonymous(SocketAddr::from(([127, 0, 0, 1], port))),
            events,
            audit: None,
        };
        SubscriptionEngine::new(ctx, CancellationToken::new()).1
    }

    #[test]
    fn remove_ignores_a_newer_connection_on_the_same_endpoint() {
        let registry = Registry::new();
        let old = handle(5000);
        let new = handle(5000);
        registry.insert(old.clone());
        let replaced = registry.insert(new.clone()).unwrap();
        assert_eq!(replaced.connection_id(), old.connection_id());

        assert!(!registry.remove(&old.peer().endpoint, old.connection_id()));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&new.peer().endpoint, new.connection_id()));
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_detached() {
        let registry = Registry::new();
        registry.insert(handle(5001));
        registry.insert(handle(5002));
        let snapshot = registry.snapshot();
        registry.remove(&snapshot[0].peer().endpoint, snapshot[0].connection_id());
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_empty_wakes_on_last_removal() {
        let registry = std::sync::Arc::new(Registry::new());
        let h = handle(5003);
        registry.insert(h.clone());
        assert!(!registry.wait_until_empty(Duration::from_millis(50)).await);

        let remover = std::sync::Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remover.remove(&h.peer().endpoint, h.connection_id());
        });
        assert!(registry.wait_until_empty(Duration::from_secs(1)).await);
    }
}
