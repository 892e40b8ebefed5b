//! Settings for the notifier ([`ServerSettings`], [`EngineTimings`]), the
//! subscriber ([`SupervisorConfig`]) and audit records ([`LoggingSettings`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{RequestSubType, SUB_PROTOCOL};

/// Construction-time configuration errors. These are fatal: nothing is built
/// from settings that fail validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required field is empty.
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    /// A field holds a value outside its allowed range.
    #[error("Invalid setting {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
    /// The server URI cannot be used to open a WebSocket.
    #[error("Invalid server URI {0}")]
    InvalidUri(String),
}

/// Timing policy of one subscription engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineTimings {
    /// How often the protocol task re-checks timers with nothing else to do.
    pub tick_ms: u64,
    /// Bound on writing one frame.
    pub send_timeout_ms: u64,
    /// Wait for the acknowledgement of a notification carrying EIDOs.
    pub notify_ack_timeout_ms: u64,
    /// Wait for the acknowledgement of a keep-alive.
    pub empty_notify_ack_timeout_ms: u64,
    /// Wait for the answer to a terminate.
    pub terminate_ack_timeout_ms: u64,
    /// Consecutive unanswered keep-alives that end a subscription.
    pub max_missed_responses: u32,
    /// Floor applied to a non-zero `expires`.
    pub min_expires_seconds: u32,
    /// Floor applied to a non-zero `minRate`.
    pub min_min_rate_seconds: u32,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            send_timeout_ms: 5000,
            notify_ack_timeout_ms: 5000,
            empty_notify_ack_timeout_ms: 1000,
            terminate_ack_timeout_ms: 1000,
            max_missed_responses: 3,
            min_expires_seconds: 15,
            min_min_rate_seconds: 5,
        }
    }
}

impl EngineTimings {
    /// Raises a requested `expires` to the floor. Zero means "never expires"
    /// and is kept as is.
    pub fn clamp_expires(&self, requested: u32) -> u32 {
        clamp_nonzero(requested, self.min_expires_seconds)
    }

    /// Raises a requested `minRate` to the floor. Zero disables keep-alives
    /// and is kept as is.
    pub fn clamp_min_rate(&self, requested: u32) -> u32 {
        clamp_nonzero(requested, self.min_min_rate_seconds)
    }

    /// [`Self::tick_ms`] as a duration.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// [`Self::send_timeout_ms`] as a duration.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// [`Self::notify_ack_timeout_ms`] as a duration.
    pub fn notify_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_ack_timeout_ms)
    }

    /// [`Self::empty_notify_ack_timeout_ms`] as a duration.
    pub fn empty_notify_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.empty_notify_ack_timeout_ms)
    }

    /// [`Self::terminate_ack_timeout_ms`] as a duration.
    pub fn terminate_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_ack_timeout_ms)
    }

    /// Checks that every bound is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("tickMs", self.tick_ms),
            ("sendTimeoutMs", self.send_timeout_ms),
            ("notifyAckTimeoutMs", self.notify_ack_timeout_ms),
            ("emptyNotifyAckTimeoutMs", self.empty_notify_ack_timeout_ms),
            ("terminateAckTimeoutMs", self.terminate_ack_timeout_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
            }
        }
        if self.max_missed_responses == 0 {
            return Err(ConfigError::Invalid {
                field: "maxMissedResponses",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn clamp_nonzero(requested: u32, floor: u32) -> u32 {
    if requested == 0 {
        0
    } else {
        requested.max(floor)
    }
}

/// Settings of the notifier side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Path subscribers open their WebSocket on.
    pub ws_path: String,
    /// Path prefix of the retrieval channel; the reference id follows it.
    pub eido_path: String,
    /// Sub-protocol offered during the WebSocket handshake.
    pub sub_protocol: String,
    /// Upper bound on waiting for engines to finish during shutdown.
    pub shutdown_timeout_ms: u64,
    /// Timing policy applied to every connection.
    pub timings: EngineTimings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_path: "/IncidentData/ent".to_string(),
            eido_path: "/incidents/eidos".to_string(),
            sub_protocol: SUB_PROTOCOL.to_string(),
            shutdown_timeout_ms: 3000,
            timings: EngineTimings::default(),
        }
    }
}

impl ServerSettings {
    /// [`Self::shutdown_timeout_ms`] as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Checks paths, the sub-protocol and the timing policy.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_path("wsPath", &self.ws_path)?;
        check_path("eidoPath", &self.eido_path)?;
        if self.ws_path.trim_end_matches('/') == self.eido_path.trim_end_matches('/') {
            return Err(ConfigError::Invalid {
                field: "eidoPath",
                reason: "must differ from wsPath".into(),
            });
        }
        if self.sub_protocol.trim().is_empty() {
            return Err(ConfigError::Missing("subProtocol"));
        }
        self.timings.validate()
    }
}

fn check_path(field: &'static str, path: &str) -> Result<(), ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::Missing(field));
    }
    if !path.starts_with('/') || path == "/" {
        return Err(ConfigError::Invalid {
            field,
            reason: format!("{path:?} must be an absolute, non-root path"),
        });
    }
    Ok(())
}

/// Settings of the subscriber side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    /// `ws://` or `wss://` URI of the notifier's WebSocket endpoint.
    pub server_uri: String,
    /// Requested subscription lifetime; 0 never expires.
    pub expires_seconds: u32,
    /// Requested keep-alive interval; 0 disables keep-alives.
    pub min_rate_seconds: u32,
    /// `new` for every EIDO, `single` for one incident.
    pub request_sub_type: RequestSubType,
    /// Incident to follow when `requestSubType` is `single`.
    pub incident_id: Option<String>,
    /// Minimum spacing between connection attempts.
    pub connect_interval_ms: u64,
    /// Bound on one connection attempt.
    pub connect_timeout_ms: u64,
    /// Wait for the answer to a subscribe.
    pub subscribe_timeout_ms: u64,
    /// Wait for the answer to the unsubscribe sent on shutdown.
    pub unsubscribe_timeout_ms: u64,
    /// How often the supervisor re-checks its timers.
    pub tick_ms: u64,
    /// Sub-protocol requested during the WebSocket handshake.
    pub sub_protocol: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_uri: String::new(),
            expires_seconds: 60,
            min_rate_seconds: 20,
            request_sub_type: RequestSubType::New,
            incident_id: None,
            connect_interval_ms: 5000,
            connect_timeout_ms: 5000,
            subscribe_timeout_ms: 2000,
            unsubscribe_timeout_ms: 1000,
            tick_ms: 100,
            sub_protocol: SUB_PROTOCOL.to_string(),
        }
    }
}

impl SupervisorConfig {
    /// A default configuration pointed at `server_uri`.
    pub fn new(server_uri: impl Into<String>) -> Self {
        Self { server_uri: server_uri.into(), ..Self::default() }
    }

    /// [`Self::connect_interval_ms`] as a duration.
    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    /// [`Self::connect_timeout_ms`] as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// [`Self::subscribe_timeout_ms`] as a duration.
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// [`Self::unsubscribe_timeout_ms`] as a duration.
    pub fn unsubscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.unsubscribe_timeout_ms)
    }

    /// [`Self::tick_ms`] as a duration.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Checks the URI, the subscription parameters and the timers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let uri = self.server_uri.trim();
        if uri.is_empty() {
            return Err(ConfigError::Missing("serverUri"));
        }
        let rest = uri
            .strip_prefix("wss://")
            .or_else(|| uri.strip_prefix("ws://"))
            .ok_or_else(|| ConfigError::InvalidUri(uri.to_string()))?;
        if rest.is_empty() || rest.starts_with('/') {
            return Err(ConfigError::InvalidUri(uri.to_string()));
        }
        // Resubscription happens two seconds before expiry.
        if (1..=2).contains(&self.expires_seconds) {
            return Err(ConfigError::Invalid {
                field: "expiresSeconds",
                reason: "must be 0 or greater than 2".into(),
            });
        }
        if self.request_sub_type == RequestSubType::Single
            && self.incident_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::Missing("incidentId"));
        }
        if self.sub_protocol.trim().is_empty() {
            return Err(ConfigError::Missing("subProtocol"));
        }
        let positive = [
            ("connectIntervalMs", self.connect_interval_ms),
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("subscribeTimeoutMs", self.subscribe_timeout_ms),
            ("unsubscribeTimeoutMs", self.unsubscribe_timeout_ms),
            ("tickMs", self.tick_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid { field, reason: "must be greater than zero".into() });
            }
        }
        Ok(())
    }
}

/// Identity stamped on every audit record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Element id of this functional element.
    pub element_id: String,
    /// Agency the element belongs to.
    pub agency_id: String,
    /// Agent operating the element, if any.
    pub agency_agent_id: Option<String>,
    /// Position the element runs on, if any.
    pub agency_position_id: Option<String>,
}

impl LoggingSettings {
    /// Element and agency ids are required once audit logging is on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.element_id.trim().is_empty() {
            return Err(ConfigError::Missing("elementId"));
        }
        if self.agency_id.trim().is_empty() {
            return Err(ConfigError::Missing("agencyId"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_a_sentinel_not_clamped() {
        let timings = EngineTimings::default();
        assert_eq!(timings.clamp_expires(0), 0);
        assert_eq!(timings.clamp_min_rate(0), 0);
        assert_eq!(timings.clamp_expires(1), 15);
        assert_eq!(timings.clamp_min_rate(3), 5);
        assert_eq!(timings.clamp_expires(60), 60);
        assert_eq!(timings.clamp_min_rate(20), 20);
    }

    #[test]
    fn server_settings_fill_defaults_from_partial_json() {
        let settings: ServerSettings =
            serde_json::from_str(r#"{"wsPath":"/ws","timings":{"tickMs":50}}"#).unwrap();
        assert_eq!(settings.ws_path, "/ws");
        assert_eq!(settings.eido_path, "/incidents/eidos");
        assert_eq!(settings.timings.tick_ms, 50);
        assert_eq!(settings.timings.max_missed_responses, 3);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn server_settings_reject_bad_paths() {
        let mut settings = ServerSettings::default();
        settings.ws_path.clear();
        assert_eq!(settings.validate(), Err(ConfigError::Missing("wsPath")));

        let mut settings = ServerSettings::default();
        settings.eido_path = settings.ws_path.clone();
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid { field: "eidoPath", .. })));
    }

    #[test]
    fn supervisor_config_validation() {
        assert!(SupervisorConfig::new("wss://cad.example:8443/IncidentData/ent").validate().is_ok());
        assert_eq!(SupervisorConfig::default().validate(), Err(ConfigError::Missing("serverUri")));
        assert!(matches!(
            SupervisorConfig::new("https://cad.example").validate(),
            Err(ConfigError::InvalidUri(_))
        ));

        let mut config = SupervisorConfig::new("ws://127.0.0.1:9000/ws");
        config.expires_seconds = 2;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "expiresSeconds", .. })));
        config.expires_seconds = 0;
        assert!(config.validate().is_ok());

        config.request_sub_type = RequestSubType::Single;
        assert_eq!(config.validate(), Err(ConfigError::Missing("incidentId")));
        config.incident_id = Some("inc-1".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn logging_settings_require_element_and_agency() {
        let mut settings = LoggingSettings::default();
        assert_eq!(settings.validate(), Err(ConfigError::Missing("elementId")));
        settings.element_id = "cad.example.gov".into();
        assert_eq!(settings.validate(), Err(ConfigError::Missing("agencyId")));
        settings.agency_id = "example.gov".into();
        assert!(settings.validate().is_ok());
    }
}
