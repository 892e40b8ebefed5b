//! # NG9-1-1 Log Records
//!
//! The audit records emitted while conveying EIDOs. A [`LogRecord`] is the
//! common envelope (when, which element and agency, which peer); the
//! [`LogEvent`] it carries says what happened. Serialized, the event's fields
//! sit beside the envelope's and `logEventType` names the event.

use serde::{Deserialize, Serialize};

use crate::configs::settings::LoggingSettings;
use crate::core::peer::PeerIdentity;
use crate::eido::EidoDocument;
use crate::utils::nena_now;

/// Which way a message travelled relative to this element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the peer.
    Incoming,
    /// Sent to the peer.
    Outgoing,
}

/// One audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "logEventType", rename_all_fields = "camelCase")]
pub enum LogEvent {
    /// A WebSocket was accepted.
    WebSocketEstablished {
        web_socket_id: String,
        status_code: u16,
    },
    /// A WebSocket closed.
    WebSocketTerminated {
        web_socket_id: String,
        close_code: Option<u16>,
        close_text: String,
        direction: Direction,
    },
    /// A subscribe request arrived.
    SubscriptionRequested {
        query_id: String,
        subscription_id: Option<String>,
        request_sub_type: String,
        incident_id: Option<String>,
        expires: Option<u32>,
        min_rate: Option<u32>,
        direction: Direction,
    },
    /// The answer to a subscribe request.
    SubscriptionRequestedResponse {
        query_id: Option<String>,
        subscription_id: Option<String>,
        expires: Option<u32>,
        min_rate: Option<u32>,
        error_code: u16,
        error_text: String,
        direction: Direction,
    },
    /// A subscription was ended by unsubscribe or terminate.
    SubscriptionTerminated {
        query_id: String,
        subscription_id: String,
        reason: Option<String>,
        direction: Direction,
    },
    /// The answer to an unsubscribe or terminate; no status when none arrived.
    SubscriptionTerminatedResponse {
        query_id: Option<String>,
        subscription_id: Option<String>,
        status_code: Option<u16>,
        status_text: Option<String>,
        direction: Direction,
    },
    /// One EIDO was delivered, either in a notification or through retrieval.
    EidoLogEvent {
        call_id: Option<String>,
        incident_id: Option<String>,
        body: EidoDocument,
        direction: Direction,
        subscription_id: Option<String>,
    },
    /// A notification went unacknowledged.
    EidoTransmissionError {
        transaction_id: String,
        subscription_id: String,
        retries: u32,
        reason_code: String,
        reason_text: String,
    },
}

impl LogEvent {
    /// Delivery of `eido` on `subscription_id` (or through retrieval, when
    /// there is none).
    pub fn eido_delivered(eido: &EidoDocument, subscription_id: Option<&str>) -> Self {
        LogEvent::EidoLogEvent {
            call_id: eido.call_id().map(str::to_owned),
            incident_id: eido.id().map(str::to_owned),
            body: eido.clone(),
            direction: Direction::Outgoing,
            subscription_id: subscription_id.map(str::to_owned),
        }
    }

    /// A notification that timed out waiting for its acknowledgement.
    pub fn transmission_timeout(transaction_id: &str, subscription_id: &str) -> Self {
        LogEvent::EidoTransmissionError {
            transaction_id: transaction_id.to_owned(),
            subscription_id: subscription_id.to_owned(),
            retries: 1,
            reason_code: "408".to_string(),
            reason_text: "Timeout".to_string(),
        }
    }

    /// The `logEventType` this event serializes with.
    pub fn event_type(&self) -> &'static str {
        match self {
            LogEvent::WebSocketEstablished { .. } => "WebSocketEstablished",
            LogEvent::WebSocketTerminated { .. } => "WebSocketTerminated",
            LogEvent::SubscriptionRequested { .. } => "SubscriptionRequested",
            LogEvent::SubscriptionRequestedResponse { .. } => "SubscriptionRequestedResponse",
            LogEvent::SubscriptionTerminated { .. } => "SubscriptionTerminated",
            LogEvent::SubscriptionTerminatedResponse { .. } => "SubscriptionTerminatedResponse",
            LogEvent::EidoLogEvent { .. } => "EidoLogEvent",
            LogEvent::EidoTransmissionError { .. } => "EidoTransmissionError",
        }
    }
}

/// The envelope every audit event is recorded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    /// NENA timestamp of the record.
    pub timestamp: String,
    /// Element that produced the record.
    pub element_id: String,
    /// Agency of that element.
    pub agency_id: String,
    /// Agent, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency_agent_id: Option<String>,
    /// Position, if configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency_position_id: Option<String>,
    /// Remote `ip:port` of the peer.
    pub ip_address_port: String,
    /// Credential id of the peer, or its endpoint.
    pub peer_id: String,
    /// What happened.
    #[serde(flatten)]
    pub event: LogEvent,
}

impl LogRecord {
    /// Stamps `event` with the current time, the element identity and the peer.
    pub fn new(settings: &LoggingSettings, peer: &PeerIdentity, event: LogEvent) -> Self {
        Self {
            timestamp: nena_now(),
            element_id: settings.element_id.clone(),
            agency_id: settings.agency_id.clone(),
            agency_agent_id: settings.agency_agent_id.clone(),
            agency_position_id: settings.agency_position_id.clone(),
            ip_address_port: peer.endpoint.to_string(),
            peer_id: peer.peer_id(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn record_flattens_event_beside_envelope() {
        let settings = LoggingSettings {
            element_id: "cad.example.gov".into(),
            agency_id: "example.gov".into(),
            agency_agent_id: None,
            agency_position_id: Some("pos-4".into()),
        };
        let peer = PeerIdentity::anonymous("198.51.100.2:6001".parse().unwrap());
        let eido = EidoDocument::new(json!({"$id": "e1", "callComponent": [{"$id": "c1"}]}));
        let record = LogRecord::new(&settings, &peer, LogEvent::eido_delivered(&eido, Some("s1")));

        let value: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["logEventType"], "EidoLogEvent");
        assert_eq!(value["elementId"], "cad.example.gov");
        assert_eq!(value["agencyPositionId"], "pos-4");
        assert!(value.get("agencyAgentId").is_none());
        assert_eq!(value["ipAddressPort"], "198.51.100.2:6001");
        assert_eq!(value["peerId"], "198.51.100.2:6001");
        assert_eq!(value["callId"], "c1");
        assert_eq!(value["incidentId"], "e1");
        assert_eq!(value["direction"], "outgoing");
        assert_eq!(value["subscriptionId"], "s1");
        assert_eq!(value["body"]["$id"], "e1");
    }

    #[test]
    fn transmission_timeout_uses_408() {
        let event = LogEvent::transmission_timeout("t1", "s1");
        assert_eq!(event.event_type(), "EidoTransmissionError");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["reasonCode"], "408");
        assert_eq!(value["reasonText"], "Timeout");
        assert_eq!(value["retries"], 1);
    }
}
