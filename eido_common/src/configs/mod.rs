//! # Configuration Module
//!
//! Typed settings for the notifier, the subscriber and the audit records.
//! Every settings type deserializes from camelCase JSON with defaults for the
//! fields left out, and is checked by `validate()` before anything is built
//! from it.

/// Settings types, their defaults and validation.
pub mod settings;
