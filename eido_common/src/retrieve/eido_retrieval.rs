//! # EIDO Retrieval Channel
//!
//! The out-of-band path for fetching one EIDO by reference id. The notifier
//! answers `GET <eido_path>/<referenceId>` by asking an application-supplied
//! [`EidoRetrieval`] for the document. This path shares no state with the
//! subscription engines.

use crate::core::peer::PeerIdentity;
use crate::eido::EidoDocument;

/// Content type of a successful retrieval response.
pub const EIDO_CONTENT_TYPE: &str = "application/emergency.eido+json";

/// What the application answers for one reference id.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalOutcome {
    /// The document was found.
    Found(EidoDocument),
    /// The request is declined with this HTTP status, e.g. 404.
    Declined(u16),
}

/// Resolves reference ids to EIDOs. Called on a blocking thread, so
/// implementations may read files or query a database synchronously.
pub trait EidoRetrieval: Send + Sync {
    /// Looks up `reference_id` on behalf of `peer`.
    fn retrieve(&self, reference_id: &str, peer: &PeerIdentity) -> RetrievalOutcome;
}

impl<F> EidoRetrieval for F
where
    F: Fn(&str, &PeerIdentity) -> RetrievalOutcome + Send + Sync,
{
    fn retrieve(&self, reference_id: &str, peer: &PeerIdentity) -> RetrievalOutcome {
        self(reference_id, peer)
    }
}

/// Declines every request with 404.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetrieval;

impl EidoRetrieval for NoRetrieval {
    fn retrieve(&self, _reference_id: &str, _peer: &PeerIdentity) -> RetrievalOutcome {
        RetrievalOutcome::Declined(404)
    }
}

/// The HTTP answer to one retrieval request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResponse {
    /// HTTP status.
    pub status: u16,
    /// Set only on success.
    pub content_type: Option<&'static str>,
    /// The serialized EIDO, or empty.
    pub body: String,
    /// The document that was returned, for auditing.
    pub eido: Option<EidoDocument>,
}

impl RetrievalResponse {
    fn empty(status: u16) -> Self {
        Self { status, content_type: None, body: String::new(), eido: None }
    }
}

/// The trailing path segment, or `None` when it is empty.
pub fn reference_id(path: &str) -> Option<&str> {
    let (_, last) = path.rsplit_once('/').unwrap_or(("", path));
    (!last.is_empty()).then_some(last)
}

/// Answers a retrieval request for `path`.
pub fn resolve(retrieval: &dyn EidoRetrieval, path: &str, peer: &PeerIdentity) -> RetrievalResponse {
    let Some(id) = reference_id(path) else {
        log::warn!("Retrieval from {} without a reference id: {}", peer, path);
        return RetrievalResponse::empty(400);
    };
    match retrieval.retrieve(id, peer) {
        RetrievalOutcome::Declined(status) => {
            log::debug!("Retrieval of {} for {} declined with {}", id, peer, status);
            RetrievalResponse::empty(status)
        }
        RetrievalOutcome::Found(eido) => match eido.to_json() {
            Ok(body) => RetrievalResponse {
                status: 200,
                content_type: Some(EIDO_CONTENT_TYPE),
                body,
                eido: Some(eido),
            },
            Err(e) => {
                log::error!("Failed to serialize EIDO {} for {}: {}", id, peer, e);
                RetrievalResponse::empty(500)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::SocketAddr;

    fn peer() -> PeerIdentity {
        PeerIdentity::anonymous(SocketAddr::from(([10, 0, 0, 1], 4000)))
    }

    #[test]
    fn reference_id_is_the_trailing_segment() {
        assert_eq!(reference_id("/incidents/eidos/abc"), Some("abc"));
        assert_eq!(reference_id("/incidents/eidos/"), None);
        assert_eq!(reference_id("abc"), Some("abc"));
    }

    #[test]
    fn found_document_is_served_as_eido_json() {
        let lookup = |id: &str, _: &PeerIdentity| {
            if id == "e1" {
                RetrievalOutcome::Found(EidoDocument::new(json!({ "$id": "e1" })))
            } else {
                RetrievalOutcome::Declined(404)
            }
        };
        let found = resolve(&lookup, "/incidents/eidos/e1", &peer());
        assert_eq!(found.status, 200);
        assert_eq!(found.content_type, Some(EIDO_CONTENT_TYPE));
        assert_eq!(found.body, r#"{"$id":"e1"}"#);

        let missing = resolve(&lookup, "/incidents/eidos/e2", &peer());
        assert_eq!(missing, RetrievalResponse::empty(404));
    }

    #[test]
    fn empty_reference_is_a_bad_request() {
        let response = resolve(&NoRetrieval, "/incidents/eidos/", &peer());
        assert_eq!(response.status, 400);
        assert!(response.body.is_empty());
    }

    #[test]
    fn declined_status_is_passed_through() {
        let forbidden = |_: &str, _: &PeerIdentity| RetrievalOutcome::Declined(403);
        assert_eq!(resolve(&forbidden, "/x/y", &peer()).status, 403);
    }
}
