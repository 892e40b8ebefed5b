//! rustls configuration for both ends, built from PEM files.
//!
//! On the notifier side [`server_config`] terminates TLS and, given a client
//! CA, verifies client certificates against it (required or optional).
//! [`CredentialAcceptor`] then attaches the verified leaf certificate to every
//! request of the connection, identified by its SHA-256 fingerprint.
//!
//! On the subscriber side [`client_config`] picks the trust roots (a CA file
//! or the platform store) and optionally a client certificate to present.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::{self, PemObject};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use thiserror::Error;

/// Errors raised while building a TLS configuration.
#[derive(Error, Debug)]
pub enum TlsError {
    /// A PEM file could not be read or parsed.
    #[error("Failed to read {path}: {source}")]
    Pem {
        /// The file.
        path: PathBuf,
        /// What went wrong.
        source: pem::Error,
    },
    /// A certificate file held no certificates.
    #[error("No certificates in {0}")]
    NoCertificates(PathBuf),
    /// A CA certificate was refused as a trust anchor.
    #[error("Invalid CA certificate in {path}: {source}")]
    Anchor {
        /// The CA file.
        path: PathBuf,
        /// Why it was refused.
        source: rustls::Error,
    },
    /// rustls refused the configuration.
    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),
    /// The client certificate verifier could not be built.
    #[cfg(feature = "server")]
    #[error("Client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Reads every certificate in a PEM file. An empty file is an error.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem_error = |source| TlsError::Pem { path: path.to_path_buf(), source };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(pem_error)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(pem_error)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

/// Reads the first private key in a PEM file (PKCS#8, PKCS#1 or SEC1).
pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|source| TlsError::Pem { path: path.to_path_buf(), source })
}

/// Trust anchors from a CA file.
pub fn load_roots(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|source| TlsError::Anchor { path: path.to_path_buf(), source })?;
    }
    Ok(roots)
}

#[cfg(feature = "client")]
pub use client::client_config;

#[cfg(feature = "client")]
mod client {
    use std::path::Path;

    use rustls::{ClientConfig, RootCertStore};

    use super::{load_certs, load_key, load_roots, provider, TlsError};

    /// Subscriber TLS: servers are validated against `ca_path`, or the
    /// platform roots when absent. `identity` is a certificate chain and key
    /// to present when the notifier asks for one.
    pub fn client_config(ca_path: Option<&Path>, identity: Option<(&Path, &Path)>) -> Result<ClientConfig, TlsError> {
        let roots = match ca_path {
            Some(path) => load_roots(path)?,
            None => native_roots(),
        };
        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);
        match identity {
            Some((cert_path, key_path)) => {
                Ok(builder.with_client_auth_cert(load_certs(cert_path)?, load_key(key_path)?)?)
            }
            None => Ok(builder.with_no_client_auth()),
        }
    }

    fn native_roots() -> RootCertStore {
        let native = rustls_native_certs::load_native_certs();
        for error in native.errors {
            log::warn!("Error loading a native certificate: {}", error);
        }
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        log::debug!("Loaded {} native root certificate(s), ignored {}", added, ignored);
        roots
    }
}

#[cfg(feature = "server")]
pub use server::{credential_from_certificate, server_config, ClientAuth, CredentialAcceptor, ID_TYPE_CERT_SHA256};

#[cfg(feature = "server")]
mod server {
    use std::io;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use axum::middleware::AddExtension;
    use axum::Extension;
    use axum_server::accept::{Accept, DefaultAcceptor};
    use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
    use futures_util::future::BoxFuture;
    use rustls::pki_types::CertificateDer;
    use rustls::server::WebPkiClientVerifier;
    use rustls::ServerConfig;
    use sha2::{Digest, Sha256};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_rustls::server::TlsStream;
    use tower::Layer;

    use super::{load_certs, load_key, load_roots, provider, TlsError};
    use crate::core::peer::{ClientCredential, TlsClientCredential};

    /// `idType` of credentials taken from a client certificate.
    pub const ID_TYPE_CERT_SHA256: &str = "x509-sha256";

    /// Client certificate verification.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ClientAuth {
        /// PEM file of the CAs client certificates must chain to.
        pub ca_path: PathBuf,
        /// Refuse the handshake when no certificate is presented.
        pub required: bool,
    }

    /// Notifier TLS from a certificate chain and key, with client
    /// certificates verified when `client_auth` is set.
    pub fn server_config(
        cert_path: &Path,
        key_path: &Path,
        client_auth: Option<&ClientAuth>,
    ) -> Result<ServerConfig, TlsError> {
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;
        let builder = ServerConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
        let builder = match client_auth {
            Some(auth) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(load_roots(&auth.ca_path)?), provider());
                let verifier = if auth.required { verifier } else { verifier.allow_unauthenticated() };
                builder.with_client_cert_verifier(verifier.build()?)
            }
            None => builder.with_no_client_auth(),
        };
        let mut config = builder.with_single_cert(certs, key)?;
        // WebSocket upgrades need HTTP/1.1.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }

    /// Identifies a client certificate by the SHA-256 of its DER encoding.
    pub fn credential_from_certificate(certificate: &CertificateDer<'_>) -> ClientCredential {
        ClientCredential::new(ID_TYPE_CERT_SHA256, hex::encode(Sha256::digest(certificate.as_ref())))
    }

    /// TLS acceptor that records the client certificate of each connection.
    ///
    /// Every request on the connection carries a [`TlsClientCredential`]
    /// extension, empty when the client presented no certificate.
    #[derive(Clone)]
    pub struct CredentialAcceptor {
        inner: RustlsAcceptor<DefaultAcceptor>,
    }

    impl CredentialAcceptor {
        /// Terminates TLS with `config`.
        pub fn new(config: RustlsConfig) -> Self {
            Self { inner: RustlsAcceptor::new(config) }
        }
    }

    impl<I, S> Accept<I, S> for CredentialAcceptor
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        S: Send + 'static,
    {
        type Stream = TlsStream<I>;
        type Service = AddExtension<S, TlsClientCredential>;
        type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

        fn accept(&self, stream: I, service: S) -> Self::Future {
            let tls = self.inner.clone();
            Box::pin(async move {
                let (stream, service) = tls.accept(stream, service).await?;
                let credential = stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|chain| chain.first())
                    .map(credential_from_certificate);
                if let Some(credential) = &credential {
                    log::debug!("Client certificate {}", credential.id);
                }
                Ok((stream, Extension(TlsClientCredential(credential)).layer(service)))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/tls").join(name)
    }

    #[test]
    fn loads_certificates_and_keys() {
        assert_eq!(load_certs(&fixture("server.pem")).unwrap().len(), 1);
        assert!(load_key(&fixture("client.key")).is_ok());
        assert!(!load_roots(&fixture("ca.pem")).unwrap().is_empty());
    }

    #[test]
    fn missing_or_empty_files_are_errors() {
        assert!(matches!(load_certs(&fixture("absent.pem")), Err(TlsError::Pem { .. })));

        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "no pem blocks here\n").unwrap();
        assert!(matches!(load_certs(&empty), Err(TlsError::NoCertificates(_))));
        assert!(matches!(load_key(&empty), Err(TlsError::Pem { .. })));
    }

    #[cfg(feature = "server")]
    #[test]
    fn server_config_with_and_without_client_auth() {
        let cert = fixture("server.pem");
        let key = fixture("server.key");
        assert!(server_config(&cert, &key, None).is_ok());

        for required in [true, false] {
            let auth = ClientAuth { ca_path: fixture("ca.pem"), required };
            let config = server_config(&cert, &key, Some(&auth)).unwrap();
            assert_eq!(config.alpn_protocols, [b"http/1.1".to_vec()]);
        }

        let bad_ca = ClientAuth { ca_path: fixture("absent.pem"), required: true };
        assert!(server_config(&cert, &key, Some(&bad_ca)).is_err());
    }

    #[cfg(feature = "server")]
    #[test]
    fn credential_is_the_certificate_fingerprint() {
        let certificate = load_certs(&fixture("client.pem")).unwrap().remove(0);
        let credential = credential_from_certificate(&certificate);
        assert_eq!(credential.id_type, ID_TYPE_CERT_SHA256);
        assert_eq!(credential.id, "cbd5221ba2b0cb9597a5009d79658be753b51b7dce6024bcf2b0345deb17b3df");
    }

    #[cfg(feature = "client")]
    #[test]
    fn client_config_presents_identity_when_given() {
        let ca = fixture("ca.pem");
        let anonymous = client_config(Some(&ca), None).unwrap();
        assert!(!anonymous.client_auth_cert_resolver.has_certs());

        let identity = client_config(Some(&ca), Some((&fixture("client.pem"), &fixture("client.key")))).unwrap();
        assert!(identity.client_auth_cert_resolver.has_certs());
    }
}
