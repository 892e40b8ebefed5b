//! # TLS Integration Tests
//!
//! The notifier behind rustls with client certificates verified against a
//! test CA, and subscribers dialing it with and without a certificate.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use eido_common::core::{http, AuthPolicy};
use eido_common::ingestors::{ClientEvent, Connector, WsConnector};
use eido_common::retrieve::NoRetrieval;
use eido_common::transport::tls::{self, ClientAuth, CredentialAcceptor, ID_TYPE_CERT_SHA256};
use eido_common::{ConnectionSupervisor, Dispatcher, ServerEvent, ServerSettings, SupervisorConfig};

/// SHA-256 of `client.pem`.
const CLIENT_FINGERPRINT: &str = "cbd5221ba2b0cb9597a5009d79658be753b51b7dce6024bcf2b0345deb17b3df";

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../eido_common/testdata/tls").join(name)
}

struct Notifier {
    dispatcher: Arc<Dispatcher>,
    addr: SocketAddr,
    handle: Handle,
    server: JoinHandle<std::io::Result<()>>,
}

impl Notifier {
    /// Client certificates are optional at the TLS layer; `policy` decides.
    async fn start(policy: AuthPolicy) -> Notifier {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dispatcher =
            Arc::new(Dispatcher::new(ServerSettings::default(), Arc::new(NoRetrieval)).unwrap().with_auth(policy));
        let client_auth = ClientAuth { ca_path: fixture("ca.pem"), required: false };
        let server_tls = tls::server_config(&fixture("server.pem"), &fixture("server.key"), Some(&client_auth)).unwrap();
        let acceptor = CredentialAcceptor::new(RustlsConfig::from_config(Arc::new(server_tls)));

        let handle = Handle::new();
        let app = http::router(Arc::clone(&dispatcher)).into_make_service_with_connect_info::<SocketAddr>();
        let server = tokio::spawn(
            axum_server::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .acceptor(acceptor)
                .handle(handle.clone())
                .serve(app),
        );
        let addr = handle.listening().await.expect("listener did not start");
        Notifier { dispatcher, addr, handle, server }
    }

    fn wss_uri(&self) -> String {
        format!("wss://{}{}", self.addr, self.dispatcher.settings().ws_path)
    }

    async fn stop(self) {
        assert!(self.dispatcher.shutdown().await);
        self.handle.graceful_shutdown(Some(Duration::from_secs(1)));
        self.server.await.unwrap().unwrap();
    }
}

fn connector(with_identity: bool) -> WsConnector {
    let client_cert = fixture("client.pem");
    let client_key = fixture("client.key");
    let identity = with_identity.then_some((client_cert.as_path(), client_key.as_path()));
    WsConnector::with_tls(Arc::new(tls::client_config(Some(&fixture("ca.pem")), identity).unwrap()))
}

async fn next_subscription(events: &mut broadcast::Receiver<ServerEvent>) -> ServerEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("no server event in time")
            .expect("event stream closed");
        if matches!(event, ServerEvent::NewSubscription { .. }) {
            return event;
        }
    }
}

#[tokio::test]
async fn listed_client_certificate_is_admitted_and_identified() {
    let notifier = Notifier::start(AuthPolicy::require_listed(vec![CLIENT_FINGERPRINT.to_string()])).await;
    let mut server_events = notifier.dispatcher.subscribe_events();
    let config = SupervisorConfig { connect_interval_ms: 200, ..SupervisorConfig::new(notifier.wss_uri()) };
    let (supervisor, mut events) = ConnectionSupervisor::start(config, connector(true)).unwrap();

    match next_subscription(&mut server_events).await {
        ServerEvent::NewSubscription { peer, .. } => {
            let credential = peer.credential.expect("peer has no credential");
            assert_eq!(credential.id_type, ID_TYPE_CERT_SHA256);
            assert_eq!(credential.id, CLIENT_FINGERPRINT);
        }
        _ => unreachable!(),
    }
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv()).await.unwrap().unwrap();
        if let ClientEvent::SubscriptionState { subscribed: true, .. } = event {
            break;
        }
    }

    assert!(supervisor.shutdown().await);
    notifier.stop().await;
}

#[tokio::test]
async fn anonymous_client_is_refused_when_a_certificate_is_required() {
    let notifier = Notifier::start(AuthPolicy::require_listed(Vec::new())).await;

    let refused = connector(false).connect(&notifier.wss_uri(), "emergency-ent1.0").await;
    assert!(refused.is_err());
    assert_eq!(notifier.dispatcher.connection_count(), 0);

    let admitted = connector(true).connect(&notifier.wss_uri(), "emergency-ent1.0").await;
    assert!(admitted.is_ok());

    drop(admitted);
    notifier.stop().await;
}
