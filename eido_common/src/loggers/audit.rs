//! The "record event" interface the protocol layers write audit events to.

use std::sync::{Arc, Mutex, PoisonError};

use crate::configs::settings::{ConfigError, LoggingSettings};
use crate::core::peer::PeerIdentity;
use crate::loggers::logrecord::{LogEvent, LogRecord};

/// Destination of audit records. Implementations must not block for long;
/// they are called from connection tasks.
pub trait AuditSink: Send + Sync {
    /// Accepts one record.
    fn record(&self, record: LogRecord);
}

/// Stamps events with the element identity and hands them to a sink.
#[derive(Clone)]
pub struct AuditLog {
    settings: Arc<LoggingSettings>,
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    /// Fails when the element or agency id is missing.
    pub fn new(settings: LoggingSettings, sink: Arc<dyn AuditSink>) -> Result<Self, ConfigError> {
        settings.validate()?;
        Ok(Self { settings: Arc::new(settings), sink })
    }

    /// Records `event` as observed on the connection with `peer`.
    pub fn record(&self, peer: &PeerIdentity, event: LogEvent) {
        log::trace!("Audit {} for {}", event.event_type(), peer);
        self.sink.record(LogRecord::new(&self.settings, peer, event));
    }

    /// The identity stamped on every record.
    pub fn settings(&self) -> &LoggingSettings {
        &self.settings
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("settings", &self.settings).finish_non_exhaustive()
    }
}

/// Keeps records in memory. Useful for tests and for embedding applications
/// that forward records themselves.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryAuditSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything recorded so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Removes and returns everything recorded so far.
    pub fn take(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: LogRecord) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_log_requires_identity_and_stamps_records() {
        let sink = Arc::new(MemoryAuditSink::new());
        assert!(AuditLog::new(LoggingSettings::default(), sink.clone()).is_err());

        let settings = LoggingSettings {
            element_id: "el".into(),
            agency_id: "ag".into(),
            ..LoggingSettings::default()
        };
        let audit = AuditLog::new(settings, sink.clone()).unwrap();
        let peer = PeerIdentity::anonymous("127.0.0.1:1".parse().unwrap());
        audit.record(&peer, LogEvent::transmission_timeout("t", "s"));

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].element_id, "el");
        assert_eq!(records[0].ip_address_port, "127.0.0.1:1");
        assert!(sink.records().is_empty());
    }
}
