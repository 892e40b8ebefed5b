//! # Core Notifier Module
//!
//! The server side of EIDO conveyance: everything between an accepted
//! WebSocket and the application that publishes EIDOs.
//!
//! ## Contained Modules:
//!
//! - **`engine`**: the per-connection `SubscriptionEngine`. It owns one
//!   subscription, answers protocol requests, batches queued EIDOs into
//!   notifications, sends keep-alives and enforces expiry.
//! - **`correlation`**: one-shot reply waiters keyed by message kind and
//!   checked against the transaction or request id they answer, used by the
//!   engine to wait for `terminateResponse` and `eventResponse`.
//! - **`registry`**: the live connections, keyed by remote endpoint.
//! - **`dispatcher`**: accepts connections, fans EIDOs out, answers
//!   retrieval requests and coordinates shutdown.
//! - **`events`**: lifecycle and diagnostic events for observers.
//! - **`peer`**: peer identity and the authentication policy.
//! - **`http`**: axum routes for the WebSocket and retrieval paths (feature
//!   `server`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Reply correlation for in-flight requests.
pub mod correlation;
/// The central fan-out point and connection acceptor.
pub mod dispatcher;
/// The per-connection protocol state machine.
pub mod engine;
/// Observer events.
pub mod events;
/// Axum routes for the notifier.
#[cfg(feature = "server")]
pub mod http;
/// Peer identity and authentication.
pub mod peer;
/// Live connection registry.
pub mod registry;

// --- Public API Re-exports ---
pub use dispatcher::{DispatchError, Dispatcher};
pub use engine::{EngineContext, EngineExit, EngineHandle, SubscriptionEngine};
pub use events::{reason, ServerEvent};
pub use peer::{AuthPolicy, ClientCredential, PeerIdentity, TlsClientCredential};
pub use registry::Registry;
