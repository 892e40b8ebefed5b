//! # Protocol Messages
//!
//! Every frame carries a single JSON object whose only key names the message
//! kind, e.g. `{"subscribe": {...}}` or `{"eventResponse": {...}}`. The
//! [`Message`] enum uses serde's externally tagged representation to produce
//! exactly that shape.
//!
//! Response fields that cannot be recovered from a malformed request
//! (`requestId`, `subscriptionId`) are optional and omitted when absent.

use serde::{Deserialize, Serialize};

use crate::eido::EidoDocument;
use crate::protocol::codec::MessageKind;
use crate::protocol::status::StatusCode;
use crate::protocol::REQUEST_TYPE_EIDO;

/// One application-layer message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Message {
    /// Subscriber asks for a new subscription or refreshes an existing one.
    Subscribe(SubscribeRequest),
    /// Notifier's answer to `subscribe`.
    SubscribeResponse(SubscribeResponse),
    /// Subscriber ends its subscription.
    Unsubscribe(UnsubscribeRequest),
    /// Notifier's answer to `unsubscribe`.
    UnsubscribeResponse(UnsubscribeResponse),
    /// Either side ends a subscription outside of a normal unsubscribe.
    Terminate(TerminateRequest),
    /// Answer to `terminate`.
    TerminateResponse(TerminateResponse),
    /// Notification carrying zero or more EIDOs.
    Event(NotifyEvent),
    /// Acknowledgement of `event`.
    EventResponse(NotifyEventResponse),
}

impl Message {
    /// The kind of this message, as named by its top-level key.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Subscribe(_) => MessageKind::Subscribe,
            Message::SubscribeResponse(_) => MessageKind::SubscribeResponse,
            Message::Unsubscribe(_) => MessageKind::Unsubscribe,
            Message::UnsubscribeResponse(_) => MessageKind::UnsubscribeResponse,
            Message::Terminate(_) => MessageKind::Terminate,
            Message::TerminateResponse(_) => MessageKind::TerminateResponse,
            Message::Event(_) => MessageKind::Event,
            Message::EventResponse(_) => MessageKind::EventResponse,
        }
    }
}

/// Whether the subscriber wants every EIDO or only those of one incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestSubType {
    /// All EIDOs.
    #[default]
    New,
    /// Only EIDOs whose incident id matches `incidentId`.
    Single,
}

/// Body of a `subscribe` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Echoed in the response.
    pub request_id: String,
    /// Always `eido`.
    pub request_type: String,
    /// `new` or `single`.
    pub request_sub_type: RequestSubType,
    /// Set when refreshing an existing subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Required for `single`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    /// Requested lifetime in seconds; 0 or absent means no expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u32>,
    /// Requested keep-alive period in seconds; 0 or absent means none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_rate: Option<u32>,
}

impl SubscribeRequest {
    /// A fresh `eido` subscribe request with a new request id.
    pub fn new(sub_type: RequestSubType) -> Self {
        Self {
            request_id: crate::utils::new_id(),
            request_type: REQUEST_TYPE_EIDO.to_string(),
            request_sub_type: sub_type,
            subscription_id: None,
            incident_id: None,
            expires: None,
            min_rate: None,
        }
    }

    /// The subscription id being refreshed, treating an empty string as absent.
    pub fn existing_subscription(&self) -> Option<&str> {
        self.subscription_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Body of a `subscribeResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    /// The request answered, if it could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// The granted or refreshed subscription.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Numeric status.
    pub status_code: u16,
    /// Reason phrase for `status_code`.
    pub status_text: String,
    /// Granted lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<u32>,
    /// Granted keep-alive period in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_rate: Option<u32>,
}

impl SubscribeResponse {
    /// A response with the given status and no optional fields set.
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            request_id: None,
            subscription_id: None,
            status_code: status.code(),
            status_text: status.text().to_string(),
            expires: None,
            min_rate: None,
        }
    }

    /// Whether the notifier accepted the request.
    pub fn is_ok(&self) -> bool {
        self.status_code == StatusCode::Ok.code()
    }
}

/// Body of an `unsubscribe` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    /// Echoed in the response.
    pub request_id: String,
    /// The subscription to end.
    pub subscription_id: String,
}

/// Body of an `unsubscribeResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeResponse {
    /// The request answered, if it could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// The subscription named in the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Numeric status.
    pub status_code: u16,
    /// Reason phrase for `status_code`.
    pub status_text: String,
}

impl UnsubscribeResponse {
    /// A response with the given status, echoing the request's ids.
    pub fn new(request_id: Option<String>, subscription_id: Option<String>, status: StatusCode) -> Self {
        Self {
            request_id,
            subscription_id,
            status_code: status.code(),
            status_text: status.text().to_string(),
        }
    }
}

/// Body of a `terminate` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateRequest {
    /// Echoed in the response.
    pub request_id: String,
    /// The subscription being ended.
    pub subscription_id: String,
}

/// Body of a `terminateResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateResponse {
    /// The request answered, if it could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// The subscription named in the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    /// Numeric status.
    pub status_code: u16,
    /// Reason phrase for `status_code`.
    pub status_text: String,
}

impl TerminateResponse {
    /// A response with the given status, echoing the request's ids.
    pub fn new(request_id: Option<String>, subscription_id: Option<String>, status: StatusCode) -> Self {
        Self {
            request_id,
            subscription_id,
            status_code: status.code(),
            status_text: status.text().to_string(),
        }
    }
}

/// Body of an `event` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyEvent {
    /// Echoed by the acknowledgement.
    pub transaction_id: String,
    /// The subscription this notification belongs to.
    pub subscription_id: String,
    /// Empty for a keep-alive.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notification: Vec<EidoDocument>,
}

impl NotifyEvent {
    /// Whether this is a keep-alive without payloads.
    pub fn is_empty(&self) -> bool {
        self.notification.is_empty()
    }
}

/// Body of an `eventResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyEventResponse {
    /// The notification acknowledged.
    pub transaction_id: String,
    /// Numeric status.
    pub status_code: u16,
    /// Reason phrase for `status_code`.
    pub status_text: String,
}

impl NotifyEventResponse {
    /// The `200 OK` acknowledgement of a notification.
    pub fn ok(transaction_id: impl Into<String>) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            status_code: StatusCode::Ok.code(),
            status_text: StatusCode::Ok.text().to_string(),
        }
    }
}
