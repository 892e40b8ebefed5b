//! # Audit Logging Module
//!
//! NG9-1-1 audit records for EIDO conveyance and the sinks they go to.
//! Diagnostic logging goes through the `log` facade everywhere else; this
//! module is only about the compliance trail.
//!
//! ## Contained Modules:
//!
//! - **`logrecord`**: the audit event types and the record envelope.
//! - **`audit`**: the [`AuditSink`](audit::AuditSink) interface, the
//!   [`AuditLog`](audit::AuditLog) front end and an in-memory sink.
//! - **`auditlocal`**: a JSON-lines file sink with rotation.

/// Audit event and record types.
pub mod logrecord;
/// The record-event interface.
pub mod audit;
/// Local file sink.
pub mod auditlocal;

pub use audit::{AuditLog, AuditSink, MemoryAuditSink};
pub use auditlocal::LocalAuditSink;
pub use logrecord::{Direction, LogEvent, LogRecord};
