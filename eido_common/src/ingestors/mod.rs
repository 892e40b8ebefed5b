//! # Subscriber Module
//!
//! The client side of EIDO conveyance. A [`ConnectionSupervisor`] keeps one
//! connection to a notifier alive, holds a subscription on it and hands the
//! EIDOs it receives to its owner.
//!
//! ## Contained Modules:
//!
//! - **`supervisor`**: the reconnect/subscribe/resubscribe state machine.
//! - **`connector`**: how a connection is opened; [`WsConnector`] uses
//!   tokio-tungstenite (feature `client`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Opening connections.
pub mod connector;
/// The connection supervisor.
pub mod supervisor;

// --- Public API Re-exports ---
#[cfg(feature = "client")]
pub use connector::WsConnector;
pub use connector::Connector;
pub use supervisor::{ClientEvent, ConnectionSupervisor, SupervisorState};
