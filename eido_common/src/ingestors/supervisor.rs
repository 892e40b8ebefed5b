//! # Connection Supervisor
//!
//! Keeps a subscriber connected and subscribed:
//!
//! ```text
//! Disconnected -> Connecting -> Connected(unsubscribed) -> Connected(subscribed)
//!       ^                                                          |
//!       +----------------------------------------------------------+
//! ```
//!
//! - Connection attempts are spaced at least `connect_interval` apart,
//!   whether the previous attempt failed or an established connection
//!   dropped.
//! - Once connected, a `subscribe` is sent. If no answer arrives within
//!   `subscribe_timeout` it is retried after `connect_interval`.
//! - A confirmed subscription is refreshed with its own id two seconds before
//!   the `expires` echoed by the notifier, so the notifier's expiry timer never
//!   fires while the connection is healthy.
//! - `terminate` and `event` requests are answered at once; received EIDOs are
//!   passed to the owner as [`ClientEvent::EidoReceived`].
//!
//! Each connection is served by one task that reads frames, runs the timers and
//! is the only writer. Waiting for a `subscribeResponse` is a deadline checked
//! on each tick rather than a blocking wait, so notifications keep being
//! acknowledged while a refresh is in flight.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::configs::settings::{ConfigError, SupervisorConfig};
use crate::eido::EidoDocument;
use crate::ingestors::connector::Connector;
use crate::protocol::{
    decode, encode, Message, NotifyEvent, NotifyEventResponse, StatusCode, SubscribeRequest, SubscribeResponse,
    TerminateRequest, TerminateResponse, UnsubscribeRequest,
};
use crate::transport::{Frame, FrameSink, FrameStream, Transport, TransportError};
use crate::utils::new_id;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const RESUBSCRIBE_LEAD: Duration = Duration::from_secs(2);

/// What the supervisor reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// An EIDO arrived in a notification.
    EidoReceived {
        /// The document.
        eido: EidoDocument,
        /// The notifier it came from.
        uri: String,
    },
    /// The connection went up or down.
    ConnectionState {
        /// Whether a connection is now open.
        connected: bool,
        /// The notifier.
        uri: String,
    },
    /// The subscription was confirmed or lost.
    SubscriptionState {
        /// Whether a subscription is now active.
        subscribed: bool,
        /// The notifier.
        uri: String,
        /// Why it was lost.
        reason: Option<String>,
    },
}

/// Where the supervisor is in its cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// Not connected; waiting for the next attempt.
    #[default]
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected, with the confirmed subscription id if there is one.
    Connected {
        /// The active subscription.
        subscription_id: Option<String>,
    },
}

/// Owns the outbound connection to one notifier.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    uri: String,
    state: watch::Receiver<SupervisorState>,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
    shutdown_bound: Duration,
}

impl ConnectionSupervisor {
    /// Validates `config` and starts connecting on the current tokio runtime.
    /// Events are delivered on the returned receiver.
    pub fn start<C: Connector>(
        config: SupervisorConfig,
        connector: C,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ConfigError> {
        config.validate()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SupervisorState::Disconnected);
        let shutdown = CancellationToken::new();
        let uri = config.server_uri.clone();
        // Unsubscribe wait plus the unsubscribe send and the close.
        let shutdown_bound = config.unsubscribe_timeout() + SEND_TIMEOUT * 2;

        let worker = Worker {
            shared: Shared { config: Arc::new(config), uri: uri.clone(), events, state, shutdown: shutdown.clone() },
            connector,
        };
        let worker = tokio::spawn(worker.run());
        Ok((Self { uri, state: state_rx, shutdown, worker, shutdown_bound }, events_rx))
    }

    /// The notifier this supervisor connects to.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The current state.
    pub fn state(&self) -> SupervisorState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// The confirmed subscription id, if any.
    pub fn subscription_id(&self) -> Option<String> {
        match &*self.state.borrow() {
            SupervisorState::Connected { subscription_id } => subscription_id.clone(),
            _ => None,
        }
    }

    /// Unsubscribes if subscribed, closes the connection and stops. Every
    /// wait is bounded, so this returns even when the notifier never answers.
    /// Returns whether the worker stopped on its own before the bound.
    pub async fn shutdown(self) -> bool {
        self.shutdown.cancel();
        let mut worker = self.worker;
        match time::timeout(self.shutdown_bound, &mut worker).await {
            Ok(_) => true,
            Err(_) => {
                log::warn!("Supervisor for {} did not stop in {:?}; aborting", self.uri, self.shutdown_bound);
                worker.abort();
                false
            }
        }
    }
}

struct Shared {
    config: Arc<SupervisorConfig>,
    uri: String,
    events: mpsc::UnboundedSender<ClientEvent>,
    state: watch::Sender<SupervisorState>,
    shutdown: CancellationToken,
}

impl Shared {
    fn emit(&self, event: ClientEvent) {
        // The owner may have dropped the receiver.
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_replace(state);
    }
}

struct Worker<C> {
    shared: Shared,
    connector: C,
}

impl<C: Connector> Worker<C> {
    async fn run(self) {
        let shared = &self.shared;
        let mut last_attempt: Option<Instant> = None;

        loop {
            if let Some(at) = last_attempt {
                tokio::select! {
                    biased;

                    () = shared.shutdown.cancelled() => break,
                    () = time::sleep_until(at + shared.config.connect_interval()) => {}
                }
            }
            if shared.shutdown.is_cancelled() {
                break;
            }
            last_attempt = Some(Instant::now());

            shared.set_state(SupervisorState::Connecting);
            log::info!("Connecting to {}", shared.uri);
            let attempt = time::timeout(
                shared.config.connect_timeout(),
                self.connector.connect(&shared.uri, &shared.config.sub_protocol),
            );
            let transport = tokio::select! {
                biased;

                () = shared.shutdown.cancelled() => break,
                result = attempt => match result {
                    Ok(Ok(transport)) => transport,
                    Ok(Err(e)) => {
                        log::warn!("Failed to connect to {}: {}", shared.uri, e);
                        shared.set_state(SupervisorState::Disconnected);
                        continue;
                    }
                    Err(_) => {
                        log::warn!("Timed out connecting to {}", shared.uri);
                        shared.set_state(SupervisorState::Disconnected);
                        continue;
                    }
                },
            };

            log::info!("Connected to {}", shared.uri);
            shared.set_state(SupervisorState::Connected { subscription_id: None });
            shared.emit(ClientEvent::ConnectionState { connected: true, uri: shared.uri.clone() });

            let exit = Session::new(shared, transport).run().await;

            shared.set_state(SupervisorState::Disconnected);
            shared.emit(ClientEvent::ConnectionState { connected: false, uri: shared.uri.clone() });
            if exit == SessionExit::Shutdown {
                break;
            }
        }

        shared.set_state(SupervisorState::Disconnected);
        log::info!("Supervisor for {} stopped", shared.uri);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionExit {
    Dropped,
    Shutdown,
}

enum Wake {
    Shutdown,
    Frame(Option<Result<Frame, TransportError>>),
    Tick,
}

struct Active {
    id: String,
    resubscribe_at: Option<Instant>,
}

struct Awaiting {
    request_id: String,
    sent_at: Instant,
    deadline: Instant,
    refresh: bool,
}

/// One connection's protocol state.
struct Session<'w> {
    shared: &'w Shared,
    sink: FrameSink,
    stream: FrameStream,
    subscription: Option<Active>,
    awaiting: Option<Awaiting>,
    next_subscribe: Instant,
}

impl<'w> Session<'w> {
    fn new(shared: &'w Shared, transport: Transport) -> Self {
        let (sink, stream) = transport.into_parts();
        Self { shared, sink, stream, subscription: None, awaiting: None, next_subscribe: Instant::now() }
    }

    async fn run(mut self) -> SessionExit {
        let mut tick = time::interval(self.shared.config.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            let wake = tokio::select! {
                biased;

                () = self.shared.shutdown.cancelled() => Wake::Shutdown,
                frame = self.stream.next() => Wake::Frame(frame),
                _ = tick.tick() => Wake::Tick,
            };
            let step = match wake {
                Wake::Shutdown => {
                    self.unsubscribe().await;
                    break SessionExit::Shutdown;
                }
                Wake::Frame(Some(Ok(Frame::Text(text)))) => self.handle_text(&text).await,
                Wake::Frame(Some(Ok(Frame::Close)) | None) => {
                    log::info!("{} closed the connection", self.shared.uri);
                    break SessionExit::Dropped;
                }
                Wake::Frame(Some(Err(e))) => {
                    log::warn!("Read from {} failed: {}", self.shared.uri, e);
                    break SessionExit::Dropped;
                }
                Wake::Tick => self.check_timers().await,
            };
            if let Err(e) = step {
                log::warn!("Send to {} failed: {}", self.shared.uri, e);
                break SessionExit::Dropped;
            }
        };

        if exit == SessionExit::Dropped {
            self.lose("Connection lost");
        }
        self.close().await;
        exit
    }

    async fn handle_text(&mut self, text: &str) -> Result<(), TransportError> {
        log::trace!("<- {}: {}", self.shared.uri, text);
        let message = match decode(text) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Malformed message from {}: {}", self.shared.uri, e);
                return Ok(());
            }
        };
        match message {
            Message::SubscribeResponse(response) => {
                self.on_subscribe_response(response);
                Ok(())
            }
            Message::Terminate(request) => self.on_terminate(request).await,
            Message::Event(event) => self.on_event(event).await,
            other => {
                log::debug!("Ignoring {} from {}", other.kind().as_key(), self.shared.uri);
                Ok(())
            }
        }
    }

    fn on_subscribe_response(&mut self, response: SubscribeResponse) {
        let expected = self
            .awaiting
            .as_ref()
            .is_some_and(|awaiting| response.request_id.as_deref() == Some(awaiting.request_id.as_str()));
        if !expected {
            log::debug!("Unsolicited subscribeResponse from {}", self.shared.uri);
            return;
        }
        let Some(awaiting) = self.awaiting.take() else {
            return;
        };
        let shared = self.shared;

        if let Some(id) = response.subscription_id.as_deref().filter(|id| !id.is_empty() && response.is_ok()) {
            let expires = response.expires.unwrap_or(shared.config.expires_seconds);
            let resubscribe_at = (u64::from(expires) > RESUBSCRIBE_LEAD.as_secs())
                .then(|| awaiting.sent_at + Duration::from_secs(expires.into()) - RESUBSCRIBE_LEAD);
            self.subscription = Some(Active { id: id.to_owned(), resubscribe_at });
            shared.set_state(SupervisorState::Connected { subscription_id: Some(id.to_owned()) });
            if awaiting.refresh {
                log::debug!("Subscription {} to {} refreshed", id, shared.uri);
            } else {
                log::info!("Subscribed to {} as {} (expires {}s)", shared.uri, id, expires);
                shared.emit(ClientEvent::SubscriptionState { subscribed: true, uri: shared.uri.clone(), reason: None });
            }
            return;
        }

        log::warn!(
            "Subscribe to {} answered {} {}",
            shared.uri,
            response.status_code,
            response.status_text
        );
        if awaiting.refresh {
            self.lose(&format!("Resubscribe rejected: {} {}", response.status_code, response.status_text));
        }
        self.next_subscribe = Instant::now() + shared.config.connect_interval();
    }

    async fn on_terminate(&mut self, request: TerminateRequest) -> Result<(), TransportError> {
        let current = self.subscription.as_ref().is_some_and(|active| active.id == request.subscription_id);
        let status = if current { StatusCode::Ok } else { StatusCode::SubscriptionDoesNotExist };
        let response = TerminateResponse::new(Some(request.request_id), Some(request.subscription_id), status);
        self.send(&Message::TerminateResponse(response)).await?;
        if current {
            self.awaiting = None;
            self.lose("Terminated by notifier");
            self.next_subscribe = Instant::now() + self.shared.config.connect_interval();
        }
        Ok(())
    }

    async fn on_event(&mut self, event: NotifyEvent) -> Result<(), TransportError> {
        self.send(&Message::EventResponse(NotifyEventResponse::ok(event.transaction_id.as_str())))
            .await?;
        if event.is_empty() {
            log::trace!("Keep-alive from {}", self.shared.uri);
            return Ok(());
        }
        log::debug!("Received {} EIDO(s) from {}", event.notification.len(), self.shared.uri);
        for eido in event.notification {
            self.shared.emit(ClientEvent::EidoReceived { eido, uri: self.shared.uri.clone() });
        }
        Ok(())
    }

    async fn check_timers(&mut self) -> Result<(), TransportError> {
        let now = Instant::now();

        if let Some(awaiting) = &self.awaiting {
            if now < awaiting.deadline {
                return Ok(());
            }
            let refresh = awaiting.refresh;
            self.awaiting = None;
            log::warn!("No subscribeResponse from {}", self.shared.uri);
            if refresh {
                self.lose("Resubscribe timed out");
                self.next_subscribe = now;
            } else {
                self.next_subscribe = now + self.shared.config.connect_interval();
            }
            return Ok(());
        }

        let refresh = match &self.subscription {
            Some(active) if active.resubscribe_at.is_some_and(|at| now >= at) => Some(active.id.clone()),
            Some(_) => return Ok(()),
            None if now >= self.next_subscribe => None,
            None => return Ok(()),
        };
        self.subscribe(refresh).await
    }

    async fn subscribe(&mut self, existing: Option<String>) -> Result<(), TransportError> {
        let config = Arc::clone(&self.shared.config);
        let mut request = SubscribeRequest::new(config.request_sub_type);
        request.subscription_id = existing;
        request.incident_id = config.incident_id.clone();
        request.expires = nonzero(config.expires_seconds);
        request.min_rate = nonzero(config.min_rate_seconds);

        let now = Instant::now();
        self.awaiting = Some(Awaiting {
            request_id: request.request_id.clone(),
            sent_at: now,
            deadline: now + config.subscribe_timeout(),
            refresh: request.subscription_id.is_some(),
        });
        self.send(&Message::Subscribe(request)).await
    }

    async fn unsubscribe(&mut self) {
        let Some(active) = self.subscription.take() else {
            return;
        };
        let request_id = new_id();
        let request = UnsubscribeRequest { request_id: request_id.clone(), subscription_id: active.id.clone() };
        match self.send(&Message::Unsubscribe(request)).await {
            Ok(()) => {
                let bound = self.shared.config.unsubscribe_timeout();
                let stream = &mut self.stream;
                let answered = async move {
                    while let Some(Ok(Frame::Text(text))) = stream.next().await {
                        if let Ok(Message::UnsubscribeResponse(response)) = decode(&text) {
                            if response.request_id.as_deref() == Some(request_id.as_str()) {
                                return true;
                            }
                        }
                    }
                    false
                };
                if !time::timeout(bound, answered).await.unwrap_or(false) {
                    log::warn!("No unsubscribeResponse from {} for {}", self.shared.uri, active.id);
                }
            }
            Err(e) => log::warn!("Failed to unsubscribe {} from {}: {}", active.id, self.shared.uri, e),
        }
        log::info!("Unsubscribed {} from {}", active.id, self.shared.uri);
        self.shared.emit(ClientEvent::SubscriptionState {
            subscribed: false,
            uri: self.shared.uri.clone(),
            reason: Some("Unsubscribed".to_string()),
        });
    }

    fn lose(&mut self, reason: &str) {
        let Some(active) = self.subscription.take() else {
            return;
        };
        log::warn!("Subscription {} to {} lost: {}", active.id, self.shared.uri, reason);
        self.shared.set_state(SupervisorState::Connected { subscription_id: None });
        self.shared.emit(ClientEvent::SubscriptionState {
            subscribed: false,
            uri: self.shared.uri.clone(),
            reason: Some(reason.to_owned()),
        });
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let text = encode(message).map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        log::trace!("-> {}: {}", self.shared.uri, text);
        match time::timeout(SEND_TIMEOUT, self.sink.send(Frame::Text(text))).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::SendTimeout(SEND_TIMEOUT)),
        }
    }

    async fn close(&mut self) {
        let sink = &mut self.sink;
        let closing = async move {
            // The peer may already be gone.
            let _ = sink.send(Frame::Close).await;
            sink.close().await
        };
        if let Ok(Err(e)) = time::timeout(SEND_TIMEOUT, closing).await {
            log::debug!("Closing connection to {}: {}", self.shared.uri, e);
        }
    }
}

fn nonzero(value: u32) -> Option<u32> {
    (value != 0).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestSubType, UnsubscribeResponse};
    use futures_util::future::BoxFuture;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const URI: &str = "ws://notifier.test/IncidentData/ent";

    /// Hands out queued in-process transports; fails when the queue is empty.
    #[derive(Clone, Default)]
    struct Queue {
        ends: Arc<Mutex<VecDeque<Transport>>>,
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    impl Queue {
        fn push(&self) -> Notifier {
            let (client, server) = Transport::pair();
            self.ends.lock().unwrap().push_back(client);
            let (sink, stream) = server.into_parts();
            Notifier { sink, stream }
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }

        fn connector(&self) -> impl Connector {
            let queue = self.clone();
            move |_: &str, _: &str| -> BoxFuture<'static, Result<Transport, TransportError>> {
                queue.attempts.lock().unwrap().push(Instant::now());
                let next = queue.ends.lock().unwrap().pop_front();
                Box::pin(async move { next.ok_or_else(|| TransportError::Connect("refused".into())) })
            }
        }
    }

    /// The notifier's end of a connection.
    struct Notifier {
        sink: FrameSink,
        stream: FrameStream,
    }

    impl Notifier {
        async fn recv(&mut self) -> Message {
            match self.stream.next().await {
                Some(Ok(Frame::Text(text))) => decode(&text).unwrap(),
                other => panic!("expected a message, got {other:?}"),
            }
        }

        async fn send(&mut self, message: Message) {
            self.sink.send(Frame::Text(encode(&message).unwrap())).await.unwrap();
        }

        async fn accept_subscribe(&mut self, subscription_id: &str, expires: u32) -> SubscribeRequest {
            let Message::Subscribe(request) = self.recv().await else { panic!("expected subscribe") };
            let mut response = SubscribeResponse::with_status(StatusCode::Ok);
            response.request_id = Some(request.request_id.clone());
            response.subscription_id = Some(subscription_id.to_owned());
            response.expires = Some(expires);
            self.send(Message::SubscribeResponse(response)).await;
            request
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig { expires_seconds: 60, min_rate_seconds: 20, ..SupervisorConfig::new(URI) }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        events.recv().await.unwrap()
    }

    #[test]
    fn rejects_invalid_configuration() {
        let queue = Queue::default();
        let err = ConnectionSupervisor::start(SupervisorConfig::new("http://x"), queue.connector()).unwrap_err();
        assert_eq!(err, ConfigError::InvalidUri("http://x".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_delivers_and_refreshes_before_expiry() {
        let queue = Queue::default();
        let mut notifier = queue.push();
        let (supervisor, mut events) = ConnectionSupervisor::start(config(), queue.connector()).unwrap();

        assert_eq!(next_event(&mut events).await, ClientEvent::ConnectionState { connected: true, uri: URI.into() });
        let first = notifier.accept_subscribe("sub-1", 60).await;
        let subscribed_at = Instant::now();
        assert_eq!(first.subscription_id, None);
        assert_eq!(first.request_sub_type, RequestSubType::New);
        assert_eq!(first.expires, Some(60));
        assert_eq!(first.min_rate, Some(20));
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::SubscriptionState { subscribed: true, uri: URI.into(), reason: None }
        );
        assert_eq!(supervisor.subscription_id().as_deref(), Some("sub-1"));

        let eido = EidoDocument::new(json!({ "$id": "e1" }));
        notifier
            .send(Message::Event(NotifyEvent {
                transaction_id: "t1".into(),
                subscription_id: "sub-1".into(),
                notification: vec![eido.clone()],
            }))
            .await;
        assert_eq!(notifier.recv().await, Message::EventResponse(NotifyEventResponse::ok("t1")));
        assert_eq!(next_event(&mut events).await, ClientEvent::EidoReceived { eido, uri: URI.into() });

        let refresh = notifier.accept_subscribe("sub-1", 60).await;
        let elapsed = subscribed_at.elapsed();
        assert_eq!(refresh.subscription_id.as_deref(), Some("sub-1"));
        assert!(elapsed >= Duration::from_secs(57) && elapsed <= Duration::from_secs(58), "{elapsed:?}");

        assert!(supervisor.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_is_answered_and_reported() {
        let queue = Queue::default();
        let mut notifier = queue.push();
        let (_supervisor, mut events) = ConnectionSupervisor::start(config(), queue.connector()).unwrap();
        next_event(&mut events).await;
        notifier.accept_subscribe("sub-9", 60).await;
        next_event(&mut events).await;

        notifier
            .send(Message::Terminate(TerminateRequest { request_id: "r-t".into(), subscription_id: "sub-9".into() }))
            .await;
        assert_eq!(
            notifier.recv().await,
            Message::TerminateResponse(TerminateResponse::new(
                Some("r-t".into()),
                Some("sub-9".into()),
                StatusCode::Ok
            ))
        );
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::SubscriptionState {
                subscribed: false,
                uri: URI.into(),
                reason: Some("Terminated by notifier".into())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_no_faster_than_the_interval() {
        let queue = Queue::default();
        let notifier = queue.push();
        let (supervisor, mut events) = ConnectionSupervisor::start(config(), queue.connector()).unwrap();
        next_event(&mut events).await;

        drop(notifier);
        assert_eq!(next_event(&mut events).await, ClientEvent::ConnectionState { connected: false, uri: URI.into() });

        let mut notifier = queue.push();
        assert_eq!(next_event(&mut events).await, ClientEvent::ConnectionState { connected: true, uri: URI.into() });
        let attempts = queue.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_millis(5000));

        notifier.accept_subscribe("sub-2", 60).await;
        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempts_are_spaced_by_the_interval() {
        let queue = Queue::default();
        let (supervisor, _events) = ConnectionSupervisor::start(config(), queue.connector()).unwrap();
        time::sleep(Duration::from_millis(12_500)).await;
        let attempts = queue.attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2] - attempts[1], Duration::from_millis(5000));
        assert_eq!(supervisor.state(), SupervisorState::Disconnected);
        assert!(supervisor.shutdown().await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_unsubscribes_and_returns_without_an_answer() {
        let queue = Queue::default();
        let mut notifier = queue.push();
        let (supervisor, mut events) = ConnectionSupervisor::start(config(), queue.connector()).unwrap();
        next_event(&mut events).await;
        notifier.accept_subscribe("sub-3", 60).await;
        next_event(&mut events).await;

        let started = Instant::now();
        let stopping = tokio::spawn(supervisor.shutdown());
        let Message::Unsubscribe(request) = notifier.recv().await else { panic!("expected unsubscribe") };
        assert_eq!(request.subscription_id, "sub-3");

        assert!(stopping.await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(started.elapsed() < Duration::from_millis(1200));
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::SubscriptionState { subscribed: false, uri: URI.into(), reason: Some("Unsubscribed".into()) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn answered_unsubscribe_stops_promptly() {
        let queue = Queue::default();
        let mut notifier = queue.push();
        let (supervisor, mut events) = ConnectionSupervisor::start(config(), queue.connector()).unwrap();
        next_event(&mut events).await;
        notifier.accept_subscribe("sub-4", 60).await;
        next_event(&mut events).await;

        let started = Instant::now();
        let stopping = tokio::spawn(supervisor.shutdown());
        let Message::Unsubscribe(request) = notifier.recv().await else { panic!("expected unsubscribe") };
        notifier
            .send(Message::UnsubscribeResponse(UnsubscribeResponse::new(
                Some(request.request_id),
                Some(request.subscription_id),
                StatusCode::Ok,
            )))
            .await;
        assert!(stopping.await.unwrap());
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(notifier.stream.next().await.unwrap().unwrap(), Frame::Close);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_subscribe_is_retried() {
        let queue = Queue::default();
        let mut notifier = queue.push();
        let (supervisor, mut events) = ConnectionSupervisor::start(config(), queue.connector()).unwrap();
        next_event(&mut events).await;

        let Message::Subscribe(first) = notifier.recv().await else { panic!("expected subscribe") };
        let sent = Instant::now();
        let retry = notifier.accept_subscribe("sub-5", 60).await;
        assert_ne!(retry.request_id, first.request_id);
        // 2 s answer bound, then the reconnect interval.
        assert!(sent.elapsed() >= Duration::from_millis(7000), "{:?}", sent.elapsed());
        supervisor.shutdown().await;
    }
}
