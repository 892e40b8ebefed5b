//! # Utilities Module
//!
//! Identifier and timestamp helpers shared by the protocol engine, the
//! supervisor and the audit records.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use uuid::Uuid;

/// A fresh opaque id for requests, subscriptions and transactions.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// The first ten hex digits of a fresh UUID.
pub fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(10);
    id
}

/// A NENA log-event URN naming one WebSocket for the lifetime of the connection.
pub fn log_event_uid(peer_id: &str) -> String {
    format!("urn:nena:uid:logEvent:{}:{}", short_id(), peer_id)
}

/// Formats a timestamp the way NENA i3 log records expect:
/// RFC 3339 with millisecond precision and a numeric offset.
pub fn nena_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// [`nena_timestamp`] of the current local time.
pub fn nena_now() -> String {
    nena_timestamp(&Local::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    #[test]
    fn log_event_uid_embeds_peer() {
        let uid = log_event_uid("10.0.0.1:5000");
        let parts: Vec<&str> = uid.splitn(5, ':').collect();
        assert_eq!(&parts[..3], ["urn", "nena", "uid"]);
        assert_eq!(parts[3], "logEvent");
        let (short, peer) = parts[4].split_once(':').unwrap();
        assert_eq!(short.len(), 10);
        assert_eq!(peer, "10.0.0.1:5000");
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn timestamp_has_millis_and_offset() {
        let at = FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, 12, 30, 0)
            .unwrap();
        assert_eq!(nena_timestamp(&at), "2024-05-01T12:30:00.000+01:00");
        let utc = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(nena_timestamp(&utc), "2024-05-01T12:30:00.000+00:00");
    }
}
