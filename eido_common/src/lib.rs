//! # eido_common
//!
//! Conveys emergency incident data objects (EIDOs) between a notifier and its
//! subscribers over WebSockets, using the subscribe/notify protocol with the
//! `emergency-ent1.0` sub-protocol.
//!
//! ## Layout:
//!
//! - **`protocol`**: message types and the JSON codec.
//! - **`eido`**: the opaque EIDO payload and its extractable identifiers.
//! - **`transport`**: the frame-level connection abstraction and its adapters.
//! - **`core`**: the per-connection subscription engine, the connection
//!   registry and the dispatcher that fans data out to subscribers.
//! - **`ingestors`**: the reconnecting subscriber (connection supervisor).
//! - **`retrieve`**: the secondary EIDO retrieval channel.
//! - **`loggers`**: NG9-1-1 audit records and audit sinks.
//! - **`configs`**: typed, validated settings.
//! - **`utils`**: identifiers and timestamps.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod core;
pub mod eido;
pub mod ingestors;
pub mod loggers;
pub mod protocol;
pub mod retrieve;
pub mod transport;
pub mod utils;

// --- Public API Re-exports ---
pub use crate::configs::settings::{ConfigError, EngineTimings, LoggingSettings, ServerSettings, SupervisorConfig};
pub use crate::core::{Dispatcher, ServerEvent};
pub use crate::eido::EidoDocument;
pub use crate::ingestors::{ClientEvent, ConnectionSupervisor};
pub use crate::protocol::Message;
pub use crate::transport::{Frame, Transport, TransportError};
