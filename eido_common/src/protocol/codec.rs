//! Text-frame codec for [`Message`].
//!
//! Decoding is strict: a frame must parse into exactly one known message kind.
//! When it does not, [`RecoveredFields::recover`] pulls out whatever a
//! `Bad Request` response can still echo back.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::messages::Message;

/// Errors raised while encoding or decoding a frame.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The frame is not valid JSON or does not match any message schema.
    #[error("Malformed message: {0}")]
    Malformed(#[source] serde_json::Error),
    /// A message could not be serialized.
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// The kind of a message as named by its top-level key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `subscribe`
    Subscribe,
    /// `subscribeResponse`
    SubscribeResponse,
    /// `unsubscribe`
    Unsubscribe,
    /// `unsubscribeResponse`
    UnsubscribeResponse,
    /// `terminate`
    Terminate,
    /// `terminateResponse`
    TerminateResponse,
    /// `event`
    Event,
    /// `eventResponse`
    EventResponse,
}

impl MessageKind {
    /// The JSON key naming this kind on the wire.
    pub fn as_key(self) -> &'static str {
        match self {
            MessageKind::Subscribe => "subscribe",
            MessageKind::SubscribeResponse => "subscribeResponse",
            MessageKind::Unsubscribe => "unsubscribe",
            MessageKind::UnsubscribeResponse => "unsubscribeResponse",
            MessageKind::Terminate => "terminate",
            MessageKind::TerminateResponse => "terminateResponse",
            MessageKind::Event => "event",
            MessageKind::EventResponse => "eventResponse",
        }
    }

    /// Parses a wire key back into a kind.
    pub fn from_key(key: &str) -> Option<Self> {
        let kind = match key {
            "subscribe" => MessageKind::Subscribe,
            "subscribeResponse" => MessageKind::SubscribeResponse,
            "unsubscribe" => MessageKind::Unsubscribe,
            "unsubscribeResponse" => MessageKind::UnsubscribeResponse,
            "terminate" => MessageKind::Terminate,
            "terminateResponse" => MessageKind::TerminateResponse,
            "event" => MessageKind::Event,
            "eventResponse" => MessageKind::EventResponse,
            _ => return None,
        };
        Some(kind)
    }
}

/// Serializes a message into the text of one frame.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(CodecError::Encode)
}

/// Parses the text of one frame into a message.
pub fn decode(text: &str) -> Result<Message, CodecError> {
    serde_json::from_str(text).map_err(CodecError::Malformed)
}

/// Names the kind of a frame without validating its body.
///
/// Returns `None` unless the frame is a JSON object with exactly one known key.
pub fn classify(text: &str) -> Option<MessageKind> {
    let value: Value = serde_json::from_str(text).ok()?;
    single_entry(&value).and_then(|(key, _)| MessageKind::from_key(key))
}

fn single_entry(value: &Value) -> Option<(&str, &Value)> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.iter().next().map(|(k, v)| (k.as_str(), v))
}

/// Fields salvaged from a frame that failed to decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredFields {
    /// The message kind, if the top-level key was recognizable.
    pub kind: Option<MessageKind>,
    /// `requestId`, if present as a string.
    pub request_id: Option<String>,
    /// `subscriptionId`, if present as a string.
    pub subscription_id: Option<String>,
    /// `transactionId`, if present as a string.
    pub transaction_id: Option<String>,
    /// `statusCode`, if present as an integer in range.
    pub status_code: Option<u16>,
    /// `statusText`, if present as a string.
    pub status_text: Option<String>,
}

impl RecoveredFields {
    /// Recovers what it can from `text`; never fails.
    pub fn recover(text: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Self::default();
        };
        let Some((key, body)) = single_entry(&value) else {
            return Self::default();
        };
        let field = |name: &str| body.get(name).and_then(Value::as_str).map(str::to_owned);
        Self {
            kind: MessageKind::from_key(key),
            request_id: field("requestId"),
            subscription_id: field("subscriptionId"),
            transaction_id: field("transactionId"),
            status_code: body
                .get("statusCode")
                .and_then(Value::as_u64)
                .and_then(|code| u16::try_from(code).ok()),
            status_text: field("statusText"),
        }
    }
}
