//! # Conveyance Integration Tests
//!
//! A [`Dispatcher`] and one or more [`ConnectionSupervisor`]s talking over
//! in-process transports. The clock is paused, so keep-alives and refresh
//! timers run without real waiting.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};

use eido_common::core::{reason, PeerIdentity};
use eido_common::protocol::RequestSubType;
use eido_common::retrieve::NoRetrieval;
use eido_common::transport::{Transport, TransportError};
use eido_common::{ClientEvent, ConnectionSupervisor, Dispatcher, EidoDocument, ServerEvent, ServerSettings, SupervisorConfig};

const URI: &str = "ws://notifier.test/IncidentData/ent";

fn dispatcher() -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(ServerSettings::default(), Arc::new(NoRetrieval)).unwrap())
}

/// Every connection attempt gets a fresh in-process transport whose far end
/// is served by `dispatcher` under its own port.
fn connector(
    dispatcher: Arc<Dispatcher>,
) -> impl Fn(&str, &str) -> BoxFuture<'static, Result<Transport, TransportError>> + Send + Sync + 'static {
    let next_port = Arc::new(AtomicU16::new(40000));
    move |_uri: &str, sub_protocol: &str| {
        let (client_end, server_end) = Transport::pair();
        let port = next_port.fetch_add(1, Ordering::Relaxed);
        let peer = PeerIdentity::anonymous(SocketAddr::from(([10, 0, 0, 1], port)));
        let dispatcher = Arc::clone(&dispatcher);
        let sub_protocol = sub_protocol.to_owned();
        tokio::spawn(async move {
            dispatcher.serve_connection(server_end, peer, Some(sub_protocol)).await;
        });
        Box::pin(async move { Ok(client_end) })
    }
}

fn config(sub_type: RequestSubType, incident_id: Option<&str>) -> SupervisorConfig {
    SupervisorConfig {
        request_sub_type: sub_type,
        incident_id: incident_id.map(str::to_owned),
        ..SupervisorConfig::new(URI)
    }
}

fn eido(id: &str, incident: &str) -> EidoDocument {
    EidoDocument::new(json!({ "$id": id, "incidentComponent": { "$id": incident } }))
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(120), events.recv())
        .await
        .expect("no client event in time")
        .expect("supervisor stopped")
}

async fn wait_subscribed(events: &mut mpsc::UnboundedReceiver<ClientEvent>) {
    loop {
        if let ClientEvent::SubscriptionState { subscribed: true, .. } = next_event(events).await {
            return;
        }
    }
}

async fn next_eido(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> EidoDocument {
    loop {
        if let ClientEvent::EidoReceived { eido, .. } = next_event(events).await {
            return eido;
        }
    }
}

async fn next_ended_reason(events: &mut broadcast::Receiver<ServerEvent>) -> String {
    loop {
        match events.recv().await {
            Ok(ServerEvent::SubscriptionEnded { reason, .. }) => return reason,
            Ok(_) => {}
            Err(e) => panic!("event stream failed: {e}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn broadcast_reaches_subscriber_across_keep_alives() {
    let dispatcher = dispatcher();
    let (supervisor, mut events) =
        ConnectionSupervisor::start(config(RequestSubType::New, None), connector(Arc::clone(&dispatcher))).unwrap();
    wait_subscribed(&mut events).await;
    assert!(supervisor.subscription_id().is_some());
    assert_eq!(dispatcher.connection_count(), 1);

    assert_eq!(dispatcher.broadcast(eido("e1", "inc-A")), Ok(1));
    assert_eq!(next_eido(&mut events).await.id(), Some("e1"));

    // Several keep-alive periods and one refresh later, the subscription is still live.
    let id = supervisor.subscription_id();
    tokio::time::sleep(Duration::from_secs(150)).await;
    assert_eq!(supervisor.subscription_id(), id);
    assert_eq!(dispatcher.broadcast(eido("e2", "inc-A")), Ok(1));
    assert_eq!(next_eido(&mut events).await.id(), Some("e2"));

    assert!(supervisor.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn single_subscription_only_sees_its_incident() {
    let dispatcher = dispatcher();
    let (all, mut all_events) =
        ConnectionSupervisor::start(config(RequestSubType::New, None), connector(Arc::clone(&dispatcher))).unwrap();
    let (single, mut single_events) = ConnectionSupervisor::start(
        config(RequestSubType::Single, Some("inc-A")),
        connector(Arc::clone(&dispatcher)),
    )
    .unwrap();
    wait_subscribed(&mut all_events).await;
    wait_subscribed(&mut single_events).await;

    // Both engines take every broadcast; the filter is applied per subscription.
    assert_eq!(dispatcher.broadcast(eido("e1", "inc-B")), Ok(2));
    assert_eq!(dispatcher.broadcast(eido("e2", "inc-A")), Ok(2));

    assert_eq!(next_eido(&mut all_events).await.id(), Some("e1"));
    assert_eq!(next_eido(&mut all_events).await.id(), Some("e2"));
    assert_eq!(next_eido(&mut single_events).await.id(), Some("e2"));

    assert!(all.shutdown().await);
    assert!(single.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn directed_send_reaches_only_the_named_subscription() {
    let dispatcher = dispatcher();
    let (first, mut first_events) =
        ConnectionSupervisor::start(config(RequestSubType::New, None), connector(Arc::clone(&dispatcher))).unwrap();
    let (second, mut second_events) =
        ConnectionSupervisor::start(config(RequestSubType::New, None), connector(Arc::clone(&dispatcher))).unwrap();
    wait_subscribed(&mut first_events).await;
    wait_subscribed(&mut second_events).await;

    let target = second.subscription_id().unwrap();
    assert_eq!(dispatcher.send_to_subscription(&target, vec![eido("e1", "inc-A")]), Ok(2));
    assert_eq!(next_eido(&mut second_events).await.id(), Some("e1"));

    assert_eq!(dispatcher.broadcast(eido("e2", "inc-A")), Ok(2));
    assert_eq!(next_eido(&mut first_events).await.id(), Some("e2"));

    assert!(first.shutdown().await);
    assert!(second.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_on_supervisor_shutdown_ends_the_subscription() {
    let dispatcher = dispatcher();
    let mut server_events = dispatcher.subscribe_events();
    let (supervisor, mut events) =
        ConnectionSupervisor::start(config(RequestSubType::New, None), connector(Arc::clone(&dispatcher))).unwrap();
    wait_subscribed(&mut events).await;

    assert!(supervisor.shutdown().await);
    assert_eq!(next_ended_reason(&mut server_events).await, reason::UNSUBSCRIBED);
}

#[tokio::test(start_paused = true)]
async fn notifier_shutdown_terminates_each_subscription_once() {
    let dispatcher = dispatcher();
    let mut server_events = dispatcher.subscribe_events();
    let (supervisor, mut events) =
        ConnectionSupervisor::start(config(RequestSubType::New, None), connector(Arc::clone(&dispatcher))).unwrap();
    wait_subscribed(&mut events).await;

    assert!(dispatcher.shutdown().await);
    assert_eq!(dispatcher.connection_count(), 0);
    assert_eq!(next_ended_reason(&mut server_events).await, reason::SHUTTING_DOWN);

    loop {
        match next_event(&mut events).await {
            ClientEvent::SubscriptionState { subscribed: false, reason, .. } => {
                assert_eq!(reason.as_deref(), Some("Terminated by notifier"));
                break;
            }
            ClientEvent::EidoReceived { .. } => panic!("no EIDO was sent"),
            _ => {}
        }
    }
    assert_eq!(dispatcher.broadcast(eido("late", "inc-A")), Err(eido_common::core::DispatchError::ShuttingDown));
    assert!(supervisor.shutdown().await);

    let mut terminated = 1;
    while let Ok(event) = server_events.try_recv() {
        if matches!(event, ServerEvent::SubscriptionEnded { .. }) {
            terminated += 1;
        }
    }
    assert_eq!(terminated, 1);
}
