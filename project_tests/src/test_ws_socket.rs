//! # WebSocket Integration Tests
//!
//! The notifier router served on a loopback listener, the subscriber dialing
//! it with [`WsConnector`], and the retrieval client fetching over HTTP.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use eido_common::core::{http, PeerIdentity};
use eido_common::ingestors::WsConnector;
use eido_common::retrieve::{EidoRetrievalClient, RetrievalError, RetrievalOutcome};
use eido_common::{ClientEvent, ConnectionSupervisor, Dispatcher, EidoDocument, ServerSettings, SupervisorConfig};

struct Notifier {
    dispatcher: Arc<Dispatcher>,
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
}

impl Notifier {
    async fn start() -> Notifier {
        let retrieval = |reference_id: &str, _: &PeerIdentity| match reference_id {
            "eido-1" => RetrievalOutcome::Found(EidoDocument::new(json!({ "$id": "eido-1" }))),
            _ => RetrievalOutcome::Declined(404),
        };
        let dispatcher = Arc::new(Dispatcher::new(ServerSettings::default(), Arc::new(retrieval)).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel();
        let server = tokio::spawn(http::serve(listener, Arc::clone(&dispatcher), async move {
            let _ = stopped.await;
        }));
        Notifier { dispatcher, addr, stop, server }
    }

    fn ws_uri(&self) -> String {
        format!("ws://{}{}", self.addr, self.dispatcher.settings().ws_path)
    }

    fn eido_url(&self) -> String {
        format!("http://{}{}", self.addr, self.dispatcher.settings().eido_path)
    }

    async fn stop(self) {
        assert!(self.dispatcher.shutdown().await);
        let _ = self.stop.send(());
        self.server.await.unwrap().unwrap();
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("no client event in time")
        .expect("supervisor stopped")
}

fn fast_config(uri: String) -> SupervisorConfig {
    SupervisorConfig { connect_interval_ms: 200, ..SupervisorConfig::new(uri) }
}

#[tokio::test]
async fn subscriber_receives_broadcast_over_websocket() {
    let notifier = Notifier::start().await;
    let (supervisor, mut events) = ConnectionSupervisor::start(fast_config(notifier.ws_uri()), WsConnector::new()).unwrap();

    assert!(matches!(next_event(&mut events).await, ClientEvent::ConnectionState { connected: true, .. }));
    assert!(matches!(next_event(&mut events).await, ClientEvent::SubscriptionState { subscribed: true, .. }));

    let eido = EidoDocument::new(json!({ "$id": "live-1", "incidentComponent": { "$id": "inc-9" } }));
    assert_eq!(notifier.dispatcher.broadcast(eido.clone()), Ok(1));
    match next_event(&mut events).await {
        ClientEvent::EidoReceived { eido: received, uri } => {
            assert_eq!(received, eido);
            assert_eq!(uri, notifier.ws_uri());
        }
        other => panic!("expected an EIDO, got {other:?}"),
    }

    assert!(supervisor.shutdown().await);
    notifier.stop().await;
}

#[tokio::test]
async fn notifier_shutdown_reaches_websocket_subscriber() {
    let notifier = Notifier::start().await;
    let (supervisor, mut events) = ConnectionSupervisor::start(fast_config(notifier.ws_uri()), WsConnector::new()).unwrap();
    loop {
        if let ClientEvent::SubscriptionState { subscribed: true, .. } = next_event(&mut events).await {
            break;
        }
    }

    assert!(notifier.dispatcher.shutdown().await);
    loop {
        if let ClientEvent::SubscriptionState { subscribed: false, reason, .. } = next_event(&mut events).await {
            assert_eq!(reason.as_deref(), Some("Terminated by notifier"));
            break;
        }
    }

    assert!(supervisor.shutdown().await);
    notifier.stop().await;
}

#[tokio::test]
async fn retrieval_route_serves_known_ids() {
    let notifier = Notifier::start().await;
    let client = EidoRetrievalClient::new(&notifier.eido_url(), Some("token".into()), 0).unwrap();

    let eido = client.fetch("eido-1").await.unwrap();
    assert_eq!(eido.id(), Some("eido-1"));

    match client.fetch("missing").await {
        Err(RetrievalError::Status { status }) => assert_eq!(status, 404),
        other => panic!("expected 404, got {other:?}"),
    }

    notifier.stop().await;
}
