//! Peer identity and the authentication policy applied when a connection is
//! accepted.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// An `(idType, id)` pair taken from the client credential, e.g. the subject
/// of a client certificate. The TLS layer attaches it to the request as an
/// extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientCredential {
    /// What kind of identifier `id` is.
    pub id_type: String,
    /// The identifier itself.
    pub id: String,
}

impl ClientCredential {
    /// Builds a credential.
    pub fn new(id_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self { id_type: id_type.into(), id: id.into() }
    }
}

/// What the TLS layer learned about the client of a connection, attached to
/// each of its requests. Empty when no client certificate was presented.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsClientCredential(pub Option<ClientCredential>);

/// Who is on the other end of a connection. Fixed when the connection is
/// accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Remote `ip:port`.
    pub endpoint: SocketAddr,
    /// Credential, when the peer presented one.
    pub credential: Option<ClientCredential>,
}

impl PeerIdentity {
    /// Builds an identity.
    pub fn new(endpoint: SocketAddr, credential: Option<ClientCredential>) -> Self {
        Self { endpoint, credential }
    }

    /// A peer with no credential.
    pub fn anonymous(endpoint: SocketAddr) -> Self {
        Self::new(endpoint, None)
    }

    /// The credential id if there is one, the endpoint otherwise.
    pub fn peer_id(&self) -> String {
        match &self.credential {
            Some(credential) => credential.id.clone(),
            None => self.endpoint.to_string(),
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credential {
            Some(credential) => write!(f, "{} ({}:{})", self.endpoint, credential.id_type, credential.id),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

type Validator = dyn Fn(&ClientCredential, SocketAddr) -> bool + Send + Sync;

/// Decides whether a connecting peer may proceed.
#[derive(Clone, Default)]
pub enum AuthPolicy {
    /// Everyone is accepted; a credential is used when present.
    #[default]
    AllowAnonymous,
    /// A credential must be present and accepted by the validator.
    RequireCredential(Arc<Validator>),
}

impl AuthPolicy {
    /// Requires a credential checked by `validator`.
    pub fn require<F>(validator: F) -> Self
    where
        F: Fn(&ClientCredential, SocketAddr) -> bool + Send + Sync + 'static,
    {
        AuthPolicy::RequireCredential(Arc::new(validator))
    }

    /// Requires a credential; when `allowed` is not empty its id must be one
    /// of them, compared without regard to case.
    pub fn require_listed(allowed: Vec<String>) -> Self {
        Self::require(move |credential, _| {
            allowed.is_empty() || allowed.iter().any(|id| id.eq_ignore_ascii_case(&credential.id))
        })
    }

    /// Applies the policy to a connecting peer.
    pub fn authorize(&self, peer: &PeerIdentity) -> bool {
        match self {
            AuthPolicy::AllowAnonymous => true,
            AuthPolicy::RequireCredential(validator) => peer
                .credential
                .as_ref()
                .is_some_and(|credential| validator(credential, peer.endpoint)),
        }
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPolicy::AllowAnonymous => f.write_str("AllowAnonymous"),
            AuthPolicy::RequireCredential(_) => f.write_str("RequireCredential(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.0.2.7:40100".parse().unwrap()
    }

    #[test]
    fn peer_id_prefers_credential() {
        assert_eq!(PeerIdentity::anonymous(addr()).peer_id(), "192.0.2.7:40100");
        let peer = PeerIdentity::new(addr(), Some(ClientCredential::new("fqdn", "psap.example.gov")));
        assert_eq!(peer.peer_id(), "psap.example.gov");
    }

    #[test]
    fn require_credential_rejects_missing_or_refused() {
        let policy = AuthPolicy::require(|credential, _| credential.id.ends_with(".gov"));
        assert!(!policy.authorize(&PeerIdentity::anonymous(addr())));
        assert!(!policy.authorize(&PeerIdentity::new(addr(), Some(ClientCredential::new("fqdn", "evil.com")))));
        assert!(policy.authorize(&PeerIdentity::new(addr(), Some(ClientCredential::new("fqdn", "psap.gov")))));
        assert!(AuthPolicy::AllowAnonymous.authorize(&PeerIdentity::anonymous(addr())));
    }

    #[test]
    fn listed_credentials_match_without_case() {
        let cert = |id: &str| PeerIdentity::new(addr(), Some(ClientCredential::new("x509-sha256", id)));
        let listed = AuthPolicy::require_listed(vec!["ABCD01".into()]);
        assert!(listed.authorize(&cert("abcd01")));
        assert!(!listed.authorize(&cert("abcd02")));
        assert!(!listed.authorize(&PeerIdentity::anonymous(addr())));

        let any = AuthPolicy::require_listed(Vec::new());
        assert!(any.authorize(&cert("anything")));
        assert!(!any.authorize(&PeerIdentity::anonymous(addr())));
    }
}
