//! # EIDO Retrieval Module
//!
//! The secondary channel for fetching one EIDO by reference id, outside of any
//! subscription.
//!
//! ## Contained Modules:
//!
//! - **`eido_retrieval`**: the notifier side. The [`EidoRetrieval`] callback
//!   the application implements, and [`resolve`], which turns a request path
//!   into an HTTP status and body.
//! - **`ky_http`**: the requester side. An HTTP client built on `reqwest` and
//!   `reqwest-middleware` with exponential-backoff retries (feature
//!   `retrieve`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Server-side retrieval callback and request resolution.
pub mod eido_retrieval;
/// HTTP client for a notifier's retrieval route.
#[cfg(feature = "retrieve")]
pub mod ky_http;

pub use eido_retrieval::{
    reference_id, resolve, EidoRetrieval, NoRetrieval, RetrievalOutcome, RetrievalResponse, EIDO_CONTENT_TYPE,
};
#[cfg(feature = "retrieve")]
pub use ky_http::{EidoRetrievalClient, RetrievalError};
