//! # EIDO Payload Module
//!
//! An EIDO is carried as an opaque JSON document. Only a handful of fields are
//! ever read by this crate: the document id, the incident id used by `single`
//! subscriptions, and the call id recorded in audit events. NENA's EIDO schema
//! names these `$id`; plain `id` is accepted as a fallback.
//!
//! The document is held behind an `Arc`, so fanning one EIDO out to many
//! subscriptions clones a pointer, not the JSON tree.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// One emergency incident data object.
#[derive(Debug, Clone, PartialEq)]
pub struct EidoDocument(Arc<Value>);

impl EidoDocument {
    /// Wraps an already parsed JSON document.
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// Parses a document from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text).map(Self::new)
    }

    /// The underlying JSON.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Serializes the document back into JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&*self.0)
    }

    /// The document id.
    pub fn id(&self) -> Option<&str> {
        component_id(&self.0)
    }

    /// The id of the incident component, used by `single` subscriptions.
    pub fn incident_id(&self) -> Option<&str> {
        self.0.get("incidentComponent").and_then(component_id)
    }

    /// The id of the first call component.
    pub fn call_id(&self) -> Option<&str> {
        self.0
            .get("callComponent")
            .and_then(Value::as_array)
            .and_then(|calls| calls.first())
            .and_then(component_id)
    }
}

fn component_id(value: &Value) -> Option<&str> {
    value
        .get("$id")
        .or_else(|| value.get("id"))
        .and_then(Value::as_str)
}

impl From<Value> for EidoDocument {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl Serialize for EidoDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for EidoDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_identifiers() {
        let eido = EidoDocument::new(json!({
            "$id": "eido-1",
            "incidentComponent": { "$id": "inc-A" },
            "callComponent": [ { "$id": "call-1" }, { "$id": "call-2" } ]
        }));
        assert_eq!(eido.id(), Some("eido-1"));
        assert_eq!(eido.incident_id(), Some("inc-A"));
        assert_eq!(eido.call_id(), Some("call-1"));
    }

    #[test]
    fn plain_id_is_accepted_and_missing_fields_are_none() {
        let eido = EidoDocument::new(json!({ "id": "e2", "callComponent": [] }));
        assert_eq!(eido.id(), Some("e2"));
        assert_eq!(eido.incident_id(), None);
        assert_eq!(eido.call_id(), None);
    }

    #[test]
    fn clones_share_the_document() {
        let eido = EidoDocument::from_json(r#"{"$id":"x"}"#).unwrap();
        let copy = eido.clone();
        assert!(Arc::ptr_eq(&eido.0, &copy.0));
        assert_eq!(copy.to_json().unwrap(), r#"{"$id":"x"}"#);
    }
}
