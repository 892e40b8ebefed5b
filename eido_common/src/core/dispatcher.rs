//! # Dispatcher
//!
//! The notifier's front door. It accepts connections, runs one
//! [`SubscriptionEngine`] per connection, fans EIDOs out to the live set, and
//! answers retrieval requests.
//!
//! ## Fan-out
//!
//! [`Dispatcher::broadcast`] and [`Dispatcher::send_to_subscription`] take a
//! snapshot of the registry and queue the EIDO on every engine. Each engine
//! applies its own filter (`single` incident, subscription id), so the
//! dispatcher holds no lock across engines and keeps no reverse index. The
//! document is shared behind an `Arc`; queueing it on a thousand engines
//! clones a pointer a thousand times.
//!
//! ## Observers
//!
//! Lifecycle and diagnostic events go out on a broadcast channel. Consumers
//! call [`Dispatcher::subscribe_events`]; a consumer that falls behind misses
//! events rather than slowing connections down.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::configs::settings::{ConfigError, ServerSettings};
use crate::core::engine::{EngineContext, EngineExit, SubscriptionEngine};
use crate::core::events::ServerEvent;
use crate::core::peer::{AuthPolicy, PeerIdentity};
use crate::core::registry::Registry;
use crate::eido::EidoDocument;
use crate::loggers::audit::AuditLog;
use crate::loggers::logrecord::LogEvent;
use crate::retrieve::eido_retrieval::{self, EidoRetrieval, RetrievalResponse};
use crate::transport::Transport;

const EVENT_CAPACITY: usize = 256;

/// Misuse of the dispatcher API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A directed send named no subscription.
    #[error("Subscription id must not be empty")]
    EmptySubscriptionId,
    /// The dispatcher is shutting down.
    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

/// Accepts connections and distributes EIDOs to their subscriptions.
pub struct Dispatcher {
    settings: ServerSettings,
    registry: Registry,
    events: broadcast::Sender<ServerEvent>,
    audit: Option<AuditLog>,
    retrieval: Arc<dyn EidoRetrieval>,
    auth: AuthPolicy,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Builds a dispatcher. Fails when the settings do not validate.
    pub fn new(settings: ServerSettings, retrieval: Arc<dyn EidoRetrieval>) -> Result<Self, ConfigError> {
        settings.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            settings,
            registry: Registry::new(),
            events,
            audit: None,
            retrieval,
            auth: AuthPolicy::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Records audit events to `audit`.
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Applies `auth` to every new connection and retrieval request.
    pub fn with_auth(mut self, auth: AuthPolicy) -> Self {
        self.auth = auth;
        self
    }

    /// A new receiver of lifecycle and diagnostic events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Whether `peer` may connect or retrieve.
    pub fn authorize(&self, peer: &PeerIdentity) -> bool {
        let allowed = self.auth.authorize(peer);
        if !allowed {
            log::warn!("Rejected unauthorized peer {}", peer);
        }
        allowed
    }

    /// Queues `eido` on every live connection. Returns how many engines took
    /// it; each still applies its own subscription filter.
    pub fn broadcast(&self, eido: EidoDocument) -> Result<usize, DispatchError> {
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }
        let queued = self
            .registry
            .snapshot()
            .iter()
            .filter(|handle| handle.enqueue(eido.clone()))
            .count();
        log::debug!("Broadcast EIDO {:?} to {} connection(s)", eido.id(), queued);
        Ok(queued)
    }

    /// Queues `eidos` for the subscription `subscription_id`. Only the engine
    /// currently holding that subscription delivers them.
    pub fn send_to_subscription(&self, subscription_id: &str, eidos: Vec<EidoDocument>) -> Result<usize, DispatchError> {
        if subscription_id.is_empty() {
            return Err(DispatchError::EmptySubscriptionId);
        }
        if self.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }
        let queued = self
            .registry
            .snapshot()
            .iter()
            .filter(|handle| handle.enqueue_batch(subscription_id, eidos.clone()))
            .count();
        Ok(queued)
    }

    /// Runs one accepted connection to completion. The connection is in the
    /// registry for exactly as long as this future runs.
    pub async fn serve_connection(
        &self,
        transport: Transport,
        peer: PeerIdentity,
        sub_protocol: Option<String>,
    ) -> EngineExit {
        log::info!("Accepted connection from {} (sub-protocol {:?})", peer, sub_protocol);
        self.emit(ServerEvent::ConnectionAccepted { peer: peer.clone(), sub_protocol });

        let ctx = EngineContext {
            timings: self.settings.timings.clone(),
            peer: peer.clone(),
            events: self.events.clone(),
            audit: self.audit.clone(),
        };
        let (engine, handle) = SubscriptionEngine::new(ctx, self.shutdown.child_token());
        let connection_id = handle.connection_id();
        if let Some(stale) = self.registry.insert(handle) {
            log::warn!("Replacing stale connection {} from {}", stale.connection_id(), peer);
            stale.shutdown();
        }

        let exit = engine.run(transport).await;

        self.registry.remove(&peer.endpoint, connection_id);
        log::info!("Connection from {} ended: {:?}", peer, exit);
        self.emit(ServerEvent::ConnectionEnded { peer });
        exit
    }

    /// Answers a retrieval request for `path`. The callback runs on a
    /// blocking thread.
    pub async fn retrieve(&self, path: &str, peer: PeerIdentity) -> RetrievalResponse {
        self.emit(ServerEvent::RetrievalRequested { peer: peer.clone(), path: path.to_owned() });

        let retrieval = Arc::clone(&self.retrieval);
        let owned_path = path.to_owned();
        let owned_peer = peer.clone();
        let response = tokio::task::spawn_blocking(move || {
            eido_retrieval::resolve(retrieval.as_ref(), &owned_path, &owned_peer)
        })
        .await
        .unwrap_or_else(|e| {
            log::error!("Retrieval callback for {} failed: {}", path, e);
            RetrievalResponse { status: 500, content_type: None, body: String::new(), eido: None }
        });

        if let (Some(audit), Some(eido)) = (&self.audit, &response.eido) {
            audit.record(&peer, LogEvent::eido_delivered(eido, None));
        }
        self.emit(ServerEvent::RetrievalResponded { peer, status: response.status, eido: response.eido.clone() });
        response
    }

    /// Asks every engine to terminate its subscription and close, then waits
    /// for the registry to drain, for at most the configured shutdown
    /// timeout. Returns whether every connection closed in time.
    pub async fn shutdown(&self) -> bool {
        log::info!("Shutting down {} connection(s)", self.registry.len());
        self.shutdown.cancel();
        let drained = self.registry.wait_until_empty(self.settings.shutdown_timeout()).await;
        if !drained {
            log::warn!("{} connection(s) still open after shutdown timeout", self.registry.len());
        }
        drained
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// The settings this dispatcher runs with.
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    fn emit(&self, event: ServerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("connections", &self.registry.len())
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}
