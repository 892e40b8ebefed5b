//! # Subscribe/Notify Protocol Module
//!
//! The application-layer messages exchanged between an EIDO notifier and its
//! subscribers, and the codec that turns them into WebSocket text frames.
//!
//! ## Contained Modules:
//!
//! - **`messages`**: the request/response documents (`subscribe`,
//!   `unsubscribe`, `terminate`, `event`, and their responses).
//! - **`status`**: the status codes carried by responses.
//! - **`codec`**: encode/decode, message-kind classification and
//!   best-effort recovery of fields from malformed requests.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Request and response documents.
pub mod messages;
/// Response status codes.
pub mod status;
/// JSON text-frame codec.
pub mod codec;

pub use codec::{classify, decode, encode, CodecError, MessageKind, RecoveredFields};
pub use messages::{
    Message, NotifyEvent, NotifyEventResponse, RequestSubType, SubscribeRequest, SubscribeResponse,
    TerminateRequest, TerminateResponse, UnsubscribeRequest, UnsubscribeResponse,
};
pub use status::StatusCode;

/// WebSocket sub-protocol identifier negotiated by both ends.
pub const SUB_PROTOCOL: &str = "emergency-ent1.0";

/// `requestType` value used in subscribe requests.
pub const REQUEST_TYPE_EIDO: &str = "eido";
