//! # Subscription Engine
//!
//! One engine serves one accepted connection. It owns that connection's
//! subscription: it answers `subscribe`, `unsubscribe` and `terminate`,
//! batches queued EIDOs into notifications, keeps the peer alive with empty
//! notifications, and ends the subscription when it expires.
//!
//! ## Tasks
//!
//! Two tasks run per connection:
//!
//! - the **receive task** reads frames, completes waiters for
//!   `terminateResponse`/`eventResponse`, and forwards everything else to the
//!   protocol task. It never sends and never waits on a reply, so a slow peer
//!   cannot stall reading.
//! - the **protocol task** owns all subscription state and is the only writer
//!   on the connection. Each wake-up (a request, a command from the
//!   dispatcher, or the tick) is followed by draining the pending queue and
//!   then re-checking the expiry and keep-alive timers.
//!
//! The dispatcher talks to a running engine only through its cloneable
//! [`EngineHandle`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::configs::settings::EngineTimings;
use crate::core::correlation::{PendingReplies, Reply, ReplyError, ReplyWaiter};
use crate::core::events::{reason, ServerEvent};
use crate::core::peer::PeerIdentity;
use crate::eido::EidoDocument;
use crate::loggers::audit::AuditLog;
use crate::loggers::logrecord::{Direction, LogEvent};
use crate::protocol::{
    decode, encode, Message, MessageKind, NotifyEvent, RecoveredFields, RequestSubType, StatusCode,
    SubscribeRequest, SubscribeResponse, TerminateRequest, TerminateResponse, UnsubscribeRequest,
    UnsubscribeResponse,
};
use crate::transport::{Frame, FrameSink, FrameStream, Transport, TransportError};
use crate::utils::{log_event_uid, new_id};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What an engine needs from its surroundings.
#[derive(Debug, Clone)]
pub struct EngineContext {
    /// Timing policy.
    pub timings: EngineTimings,
    /// The peer on the other end.
    pub peer: PeerIdentity,
    /// Where lifecycle and diagnostic events go.
    pub events: broadcast::Sender<ServerEvent>,
    /// Audit trail, when enabled.
    pub audit: Option<AuditLog>,
}

enum Command {
    Enqueue(EidoDocument),
    EnqueueBatch { subscription_id: String, eidos: Vec<EidoDocument> },
}

/// Cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    peer: PeerIdentity,
    connection_id: u64,
}

impl EngineHandle {
    /// Queues one EIDO. It is dropped by the engine unless there is a live
    /// subscription whose filter accepts it. Returns `false` once the engine
    /// has finished.
    pub fn enqueue(&self, eido: EidoDocument) -> bool {
        self.commands.send(Command::Enqueue(eido)).is_ok()
    }

    /// Queues EIDOs for the subscription `subscription_id` only. Engines with
    /// any other subscription drop them.
    pub fn enqueue_batch(&self, subscription_id: &str, eidos: Vec<EidoDocument>) -> bool {
        self.commands
            .send(Command::EnqueueBatch { subscription_id: subscription_id.to_owned(), eidos })
            .is_ok()
    }

    /// Asks the engine to terminate its subscription and close.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the engine has finished.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// The peer this engine serves.
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Process-unique id of the connection.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("peer", &self.peer)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    /// The peer closed the connection.
    PeerClosed,
    /// Reading or writing failed.
    TransportFault,
    /// The engine closed it: unsubscribe, expiry or unanswered keep-alives.
    Closed,
    /// Shutdown was requested.
    Shutdown,
}

impl EngineExit {
    fn describe(self) -> &'static str {
        match self {
            EngineExit::PeerClosed => "Closed by peer",
            EngineExit::TransportFault => "Connection error",
            EngineExit::Closed => "Closed by notifier",
            EngineExit::Shutdown => reason::SHUTTING_DOWN,
        }
    }
}

/// The protocol state machine of one connection.
pub struct SubscriptionEngine {
    ctx: EngineContext,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
}

impl SubscriptionEngine {
    /// Builds an engine and its handle. Cancelling `shutdown` has the same
    /// effect as [`EngineHandle::shutdown`].
    pub fn new(ctx: EngineContext, shutdown: CancellationToken) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EngineHandle {
            commands: tx,
            shutdown: shutdown.clone(),
            peer: ctx.peer.clone(),
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        };
        (Self { ctx, commands: rx, shutdown }, handle)
    }

    /// Drives the connection until it closes.
    pub async fn run(self, transport: Transport) -> EngineExit {
        let SubscriptionEngine { ctx, commands, shutdown } = self;
        let (sink, stream) = transport.into_parts();
        let replies = Arc::new(PendingReplies::new());
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let receiver = tokio::spawn(receive_loop(
            stream,
            Arc::clone(&replies),
            inbound_tx,
            ctx.peer.endpoint,
            ctx.events.clone(),
        ));

        let web_socket_id = log_event_uid(&ctx.peer.peer_id());
        let mut session = Session {
            ctx,
            sink,
            replies,
            inbound: inbound_rx,
            commands,
            shutdown,
            subscription: None,
            pending: VecDeque::new(),
            web_socket_id,
        };
        session.audit(LogEvent::WebSocketEstablished {
            web_socket_id: session.web_socket_id.clone(),
            status_code: 200,
        });

        let exit = session.drive().await;
        receiver.abort();
        let _ = receiver.await;
        session.close(exit).await;
        log::info!("Connection {} ended: {}", session.ctx.peer, exit.describe());
        exit
    }
}

enum Inbound {
    Request(Message),
    Malformed(String),
    Failed(TransportError),
}

async fn receive_loop(
    mut stream: FrameStream,
    replies: Arc<PendingReplies>,
    inbound: mpsc::UnboundedSender<Inbound>,
    endpoint: SocketAddr,
    events: broadcast::Sender<ServerEvent>,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Frame::Text(text)) => text,
            Ok(Frame::Close) => {
                log::debug!("{} sent close", endpoint);
                break;
            }
            Err(e) => {
                let _ = inbound.send(Inbound::Failed(e));
                break;
            }
        };
        log::trace!("<- {}: {}", endpoint, text);
        if events.receiver_count() > 0 {
            let _ = events.send(ServerEvent::MessageReceived { endpoint, text: text.clone() });
        }

        let item = match decode(&text) {
            Ok(message @ (Message::TerminateResponse(_) | Message::EventResponse(_))) => {
                if let Some(reply) = Reply::from_message(message) {
                    complete_reply(&replies, reply, endpoint);
                }
                continue;
            }
            Ok(message) => Inbound::Request(message),
            Err(e) => match Reply::recover(&text) {
                // Acks missing optional fields still answer the waiter.
                Some(reply) => {
                    log::debug!("Lenient {} from {}: {}", reply.kind.as_key(), endpoint, e);
                    complete_reply(&replies, reply, endpoint);
                    continue;
                }
                None => {
                    log::warn!("Malformed message from {}: {}", endpoint, e);
                    Inbound::Malformed(text)
                }
            },
        };
        if inbound.send(item).is_err() {
            break;
        }
    }
    replies.close();
}

fn complete_reply(replies: &PendingReplies, reply: Reply, endpoint: SocketAddr) {
    if let Err(unmatched) = replies.complete(reply) {
        log::debug!(
            "Unsolicited {} from {} (id {:?})",
            unmatched.kind.as_key(),
            endpoint,
            unmatched.id
        );
    }
}

struct Subscription {
    id: String,
    sub_type: RequestSubType,
    incident_id: Option<String>,
    expires: u32,
    min_rate: u32,
    started: Instant,
    last_notify: Instant,
    missed: u32,
}

impl Subscription {
    fn new(request: &SubscribeRequest, timings: &EngineTimings) -> Self {
        let now = Instant::now();
        Self {
            id: new_id(),
            sub_type: request.request_sub_type,
            incident_id: request.incident_id.clone(),
            expires: timings.clamp_expires(request.expires.unwrap_or(0)),
            min_rate: timings.clamp_min_rate(request.min_rate.unwrap_or(0)),
            started: now,
            last_notify: now,
            missed: 0,
        }
    }

    fn accepts(&self, eido: &EidoDocument) -> bool {
        match self.sub_type {
            RequestSubType::New => true,
            RequestSubType::Single => eido.incident_id() == self.incident_id.as_deref(),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires != 0 && now.duration_since(self.started) > Duration::from_secs(self.expires.into())
    }

    fn keep_alive_due(&self, now: Instant) -> bool {
        self.min_rate != 0 && now.duration_since(self.last_notify) > Duration::from_secs(self.min_rate.into())
    }

    fn fill(&self, response: &mut SubscribeResponse) {
        response.subscription_id = Some(self.id.clone());
        response.expires = nonzero(self.expires);
        response.min_rate = nonzero(self.min_rate);
    }
}

/// Waits for a reply. A preemptible wait gives up as soon as shutdown is
/// requested; the terminate sent during shutdown itself is not preemptible.
async fn await_reply(
    shutdown: &CancellationToken,
    waiter: ReplyWaiter,
    bound: Duration,
    preemptible: bool,
) -> Result<Reply, ReplyError> {
    if !preemptible {
        return waiter.wait(bound).await;
    }
    tokio::select! {
        biased;

        () = shutdown.cancelled() => Err(ReplyError::Cancelled),
        reply = waiter.wait(bound) => reply,
    }
}

fn nonzero(value: u32) -> Option<u32> {
    (value != 0).then_some(value)
}

fn sub_type_name(sub_type: RequestSubType) -> &'static str {
    match sub_type {
        RequestSubType::New => "new",
        RequestSubType::Single => "single",
    }
}

enum Event {
    Shutdown,
    Inbound(Option<Inbound>),
    Command(Command),
    Tick,
}

enum Flow {
    Continue,
    Exit(EngineExit),
}

struct Session {
    ctx: EngineContext,
    sink: FrameSink,
    replies: Arc<PendingReplies>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
    subscription: Option<Subscription>,
    pending: VecDeque<EidoDocument>,
    web_socket_id: String,
}

impl Session {
    async fn drive(&mut self) -> EngineExit {
        let mut tick = time::interval(self.ctx.timings.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => Event::Shutdown,
                inbound = self.inbound.recv() => Event::Inbound(inbound),
                Some(command) = self.commands.recv() => Event::Command(command),
                _ = tick.tick() => Event::Tick,
            };

            let step = match event {
                Event::Shutdown => {
                    self.shut_down().await;
                    return EngineExit::Shutdown;
                }
                Event::Inbound(None) => {
                    self.end_subscription(reason::CONNECTION_CLOSED);
                    return EngineExit::PeerClosed;
                }
                Event::Inbound(Some(Inbound::Failed(e))) => Err(e),
                Event::Inbound(Some(Inbound::Request(message))) => self.handle_request(message).await,
                Event::Inbound(Some(Inbound::Malformed(text))) => self.handle_malformed(&text).await,
                Event::Command(command) => {
                    self.apply(command);
                    Ok(Flow::Continue)
                }
                Event::Tick => Ok(Flow::Continue),
            };

            let step = match step {
                Ok(Flow::Continue) => self.service().await,
                other => other,
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(exit)) => return exit,
                Err(e) => {
                    log::warn!("Transport fault on {}: {}", self.ctx.peer, e);
                    self.end_subscription(reason::CONNECTION_ERROR);
                    return EngineExit::TransportFault;
                }
            }
        }
    }

    /// Queue first, then timers.
    async fn service(&mut self) -> Result<Flow, TransportError> {
        while let Ok(command) = self.commands.try_recv() {
            self.apply(command);
        }
        if let Flow::Exit(exit) = self.flush_pending().await? {
            return Ok(Flow::Exit(exit));
        }
        self.check_timers().await
    }

    fn apply(&mut self, command: Command) {
        let Some(subscription) = &self.subscription else {
            return;
        };
        match command {
            Command::Enqueue(eido) => {
                if subscription.accepts(&eido) {
                    self.pending.push_back(eido);
                }
            }
            Command::EnqueueBatch { subscription_id, eidos } => {
                if subscription_id == subscription.id {
                    self.pending.extend(eidos.into_iter().filter(|eido| subscription.accepts(eido)));
                }
            }
        }
    }

    async fn handle_request(&mut self, message: Message) -> Result<Flow, TransportError> {
        match message {
            Message::Subscribe(request) => self.handle_subscribe(request).await,
            Message::Unsubscribe(request) => self.handle_unsubscribe(request).await,
            Message::Terminate(request) => self.handle_terminate(request).await,
            other => {
                log::warn!("Ignoring {} from {}", other.kind().as_key(), self.ctx.peer);
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_subscribe(&mut self, request: SubscribeRequest) -> Result<Flow, TransportError> {
        let query_id = new_id();
        self.audit(LogEvent::SubscriptionRequested {
            query_id: query_id.clone(),
            subscription_id: request.subscription_id.clone(),
            request_sub_type: sub_type_name(request.request_sub_type).to_string(),
            incident_id: request.incident_id.clone(),
            expires: request.expires,
            min_rate: request.min_rate,
            direction: Direction::Incoming,
        });

        let mut response = SubscribeResponse::with_status(StatusCode::Ok);
        let mut created = None;

        match request.existing_subscription() {
            None if request.request_sub_type == RequestSubType::Single
                && request.incident_id.as_deref().map_or(true, str::is_empty) =>
            {
                log::warn!("{} asked for a single subscription without an incident id", self.ctx.peer);
                response = SubscribeResponse::with_status(StatusCode::BadRequest);
            }
            None => {
                if let Some(previous) = self.subscription.take() {
                    log::warn!(
                        "{} subscribed again while {} is active; terminating it",
                        self.ctx.peer,
                        previous.id
                    );
                    self.pending.clear();
                    let result = self.terminate_handshake(&previous.id, reason::SUPERSEDED, true).await;
                    self.fire_ended(previous.id, reason::SUPERSEDED);
                    result?;
                }
                let subscription = Subscription::new(&request, &self.ctx.timings);
                subscription.fill(&mut response);
                log::info!(
                    "{} subscribed: {} ({}, expires {}s, minRate {}s)",
                    self.ctx.peer,
                    subscription.id,
                    sub_type_name(subscription.sub_type),
                    subscription.expires,
                    subscription.min_rate
                );
                created = Some(ServerEvent::NewSubscription {
                    peer: self.ctx.peer.clone(),
                    subscription_id: subscription.id.clone(),
                    request_sub_type: subscription.sub_type,
                    incident_id: subscription.incident_id.clone(),
                    expires: subscription.expires,
                    min_rate: subscription.min_rate,
                });
                self.subscription = Some(subscription);
            }
            Some(id) => match self.subscription.as_mut() {
                Some(current) if current.id == id => {
                    current.started = Instant::now();
                    current.fill(&mut response);
                    log::debug!("{} refreshed {}", self.ctx.peer, id);
                }
                _ => {
                    log::warn!("{} refreshed unknown subscription {}", self.ctx.peer, id);
                    response = SubscribeResponse::with_status(StatusCode::NotFound);
                    response.subscription_id = Some(id.to_owned());
                }
            },
        }
        response.request_id = Some(request.request_id);

        self.audit(LogEvent::SubscriptionRequestedResponse {
            query_id: Some(query_id),
            subscription_id: response.subscription_id.clone(),
            expires: response.expires,
            min_rate: response.min_rate,
            error_code: response.status_code,
            error_text: response.status_text.clone(),
            direction: Direction::Outgoing,
        });
        self.send(&Message::SubscribeResponse(response)).await?;
        if let Some(event) = created {
            self.emit(event);
        }
        Ok(Flow::Continue)
    }

    async fn handle_unsubscribe(&mut self, request: UnsubscribeRequest) -> Result<Flow, TransportError> {
        let status = self.end_request_status(&request.subscription_id, "Unsubscribe");
        let response =
            UnsubscribeResponse::new(Some(request.request_id), Some(request.subscription_id), status);
        self.send(&Message::UnsubscribeResponse(response)).await?;

        if status == StatusCode::Ok {
            self.end_subscription(reason::UNSUBSCRIBED);
            return Ok(Flow::Exit(EngineExit::Closed));
        }
        Ok(Flow::Continue)
    }

    /// A subscriber-initiated terminate ends the subscription but keeps the
    /// connection, which may subscribe again.
    async fn handle_terminate(&mut self, request: TerminateRequest) -> Result<Flow, TransportError> {
        let status = self.end_request_status(&request.subscription_id, reason::TERMINATED_BY_SUBSCRIBER);
        let response =
            TerminateResponse::new(Some(request.request_id), Some(request.subscription_id), status);
        self.send(&Message::TerminateResponse(response)).await?;

        if status == StatusCode::Ok {
            self.end_subscription(reason::TERMINATED_BY_SUBSCRIBER);
        }
        Ok(Flow::Continue)
    }

    /// Status for an unsubscribe or terminate naming `subscription_id`, with
    /// the matching audit records.
    fn end_request_status(&self, subscription_id: &str, why: &str) -> StatusCode {
        let query_id = new_id();
        self.audit(LogEvent::SubscriptionTerminated {
            query_id: query_id.clone(),
            subscription_id: subscription_id.to_owned(),
            reason: Some(why.to_owned()),
            direction: Direction::Incoming,
        });
        let status = match &self.subscription {
            Some(current) if current.id == subscription_id => StatusCode::Ok,
            _ => {
                log::warn!("{} named unknown subscription {}", self.ctx.peer, subscription_id);
                StatusCode::SubscriptionDoesNotExist
            }
        };
        self.audit(LogEvent::SubscriptionTerminatedResponse {
            query_id: Some(query_id),
            subscription_id: Some(subscription_id.to_owned()),
            status_code: Some(status.code()),
            status_text: Some(status.text().to_owned()),
            direction: Direction::Outgoing,
        });
        status
    }

    async fn handle_malformed(&mut self, text: &str) -> Result<Flow, TransportError> {
        let fields = RecoveredFields::recover(text);
        let response = match fields.kind {
            Some(MessageKind::Unsubscribe) => Message::UnsubscribeResponse(UnsubscribeResponse::new(
                fields.request_id,
                fields.subscription_id,
                StatusCode::BadRequest,
            )),
            Some(MessageKind::Terminate) => Message::TerminateResponse(TerminateResponse::new(
                fields.request_id,
                fields.subscription_id,
                StatusCode::BadRequest,
            )),
            Some(MessageKind::Subscribe) | None => {
                let mut response = SubscribeResponse::with_status(StatusCode::BadRequest);
                response.request_id = fields.request_id;
                response.subscription_id = fields.subscription_id;
                self.audit(LogEvent::SubscriptionRequestedResponse {
                    query_id: None,
                    subscription_id: response.subscription_id.clone(),
                    expires: None,
                    min_rate: None,
                    error_code: response.status_code,
                    error_text: response.status_text.clone(),
                    direction: Direction::Outgoing,
                });
                Message::SubscribeResponse(response)
            }
            Some(other) => {
                log::debug!("Dropping malformed {} from {}", other.as_key(), self.ctx.peer);
                return Ok(Flow::Continue);
            }
        };
        self.send(&response).await?;
        Ok(Flow::Continue)
    }

    async fn flush_pending(&mut self) -> Result<Flow, TransportError> {
        if self.pending.is_empty() {
            return Ok(Flow::Continue);
        }
        let Some(subscription_id) = self.subscription.as_ref().map(|s| s.id.clone()) else {
            self.pending.clear();
            return Ok(Flow::Continue);
        };

        let batch: Vec<EidoDocument> = self.pending.drain(..).collect();
        let transaction_id = new_id();
        let waiter = self.replies.expect(MessageKind::EventResponse, Some(transaction_id.clone()));
        self.send(&Message::Event(NotifyEvent {
            transaction_id: transaction_id.clone(),
            subscription_id: subscription_id.clone(),
            notification: batch.clone(),
        }))
        .await?;
        self.mark_notified();

        match await_reply(&self.shutdown, waiter, self.ctx.timings.notify_ack_timeout(), true).await {
            Ok(_) => {
                if let Some(subscription) = self.subscription.as_mut() {
                    subscription.missed = 0;
                }
                for eido in &batch {
                    self.audit(LogEvent::eido_delivered(eido, Some(&subscription_id)));
                }
                log::debug!("Delivered {} EIDO(s) to {}", batch.len(), self.ctx.peer);
            }
            Err(ReplyError::Cancelled) => {}
            Err(e) => {
                log::warn!(
                    "Notification {} with {} EIDO(s) to {} not acknowledged: {}",
                    transaction_id,
                    batch.len(),
                    self.ctx.peer,
                    e
                );
                self.audit(LogEvent::transmission_timeout(&transaction_id, &subscription_id));
            }
        }
        Ok(Flow::Continue)
    }

    async fn check_timers(&mut self) -> Result<Flow, TransportError> {
        let now = Instant::now();
        let (expired, keep_alive_due) = match &self.subscription {
            Some(subscription) => (subscription.is_expired(now), subscription.keep_alive_due(now)),
            None => return Ok(Flow::Continue),
        };

        if expired {
            if let Some(subscription) = self.subscription.take() {
                log::info!("Subscription {} of {} expired", subscription.id, self.ctx.peer);
                self.pending.clear();
                let result = self.terminate_handshake(&subscription.id, reason::EXPIRED, true).await;
                self.fire_ended(subscription.id, reason::EXPIRED);
                result?;
            }
            return Ok(Flow::Exit(EngineExit::Closed));
        }
        if keep_alive_due {
            return self.send_keep_alive().await;
        }
        Ok(Flow::Continue)
    }

    async fn send_keep_alive(&mut self) -> Result<Flow, TransportError> {
        let Some(subscription_id) = self.subscription.as_ref().map(|s| s.id.clone()) else {
            return Ok(Flow::Continue);
        };
        let transaction_id = new_id();
        let waiter = self.replies.expect(MessageKind::EventResponse, Some(transaction_id.clone()));
        self.send(&Message::Event(NotifyEvent {
            transaction_id,
            subscription_id,
            notification: Vec::new(),
        }))
        .await?;
        self.mark_notified();

        let reply = await_reply(&self.shutdown, waiter, self.ctx.timings.empty_notify_ack_timeout(), true).await;
        let max_missed = self.ctx.timings.max_missed_responses;
        let Some(subscription) = self.subscription.as_mut() else {
            return Ok(Flow::Continue);
        };
        match reply {
            Ok(_) => subscription.missed = 0,
            Err(ReplyError::Cancelled) => {}
            Err(e) => {
                subscription.missed += 1;
                log::warn!(
                    "Keep-alive to {} unanswered ({} of {}): {}",
                    self.ctx.peer,
                    subscription.missed,
                    max_missed,
                    e
                );
                if subscription.missed >= max_missed {
                    self.end_subscription(reason::KEEP_ALIVE_TIMEOUT);
                    return Ok(Flow::Exit(EngineExit::Closed));
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Sends `terminate` for `subscription_id` and waits a bounded time for
    /// the answer. A missing answer is logged, not an error.
    async fn terminate_handshake(
        &mut self,
        subscription_id: &str,
        why: &str,
        preemptible: bool,
    ) -> Result<(), TransportError> {
        let query_id = new_id();
        let request_id = new_id();
        let waiter = self.replies.expect(MessageKind::TerminateResponse, Some(request_id.clone()));
        self.send(&Message::Terminate(TerminateRequest {
            request_id,
            subscription_id: subscription_id.to_owned(),
        }))
        .await?;
        self.audit(LogEvent::SubscriptionTerminated {
            query_id: query_id.clone(),
            subscription_id: subscription_id.to_owned(),
            reason: Some(why.to_owned()),
            direction: Direction::Outgoing,
        });

        let (status_code, status_text) =
            match await_reply(&self.shutdown, waiter, self.ctx.timings.terminate_ack_timeout(), preemptible).await {
                Ok(reply) => (reply.status_code, reply.status_text),
                Err(e) => {
                    log::info!("No terminate response from {} for {}: {}", self.ctx.peer, subscription_id, e);
                    (None, None)
                }
            };
        self.audit(LogEvent::SubscriptionTerminatedResponse {
            query_id: Some(query_id),
            subscription_id: Some(subscription_id.to_owned()),
            status_code,
            status_text,
            direction: Direction::Incoming,
        });
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let text = encode(message).map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        log::trace!("-> {}: {}", self.ctx.peer.endpoint, text);
        let observed = (self.ctx.events.receiver_count() > 0).then(|| text.clone());

        let bound = self.ctx.timings.send_timeout();
        match time::timeout(bound, self.sink.send(Frame::Text(text))).await {
            Ok(Ok(())) => {
                if let Some(text) = observed {
                    self.emit(ServerEvent::MessageSent { endpoint: self.ctx.peer.endpoint, text });
                }
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::SendTimeout(bound)),
        }
    }

    async fn shut_down(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.pending.clear();
            if let Err(e) = self.terminate_handshake(&subscription.id, reason::SHUTTING_DOWN, false).await {
                log::warn!("Could not terminate {} on {}: {}", subscription.id, self.ctx.peer, e);
            }
            self.fire_ended(subscription.id, reason::SHUTTING_DOWN);
        }
    }

    async fn close(&mut self, exit: EngineExit) {
        let bound = self.ctx.timings.send_timeout();
        let initiate = matches!(exit, EngineExit::Closed | EngineExit::Shutdown);
        let sink = &mut self.sink;
        let closing = async move {
            if initiate {
                sink.send(Frame::Close).await?;
            }
            sink.close().await
        };
        match time::timeout(bound, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Closing {} failed: {}", self.ctx.peer, e),
            Err(_) => log::debug!("Closing {} timed out", self.ctx.peer),
        }

        let (close_code, direction) = match exit {
            EngineExit::PeerClosed => (None, Direction::Incoming),
            EngineExit::TransportFault => (None, Direction::Outgoing),
            EngineExit::Closed | EngineExit::Shutdown => (Some(1000), Direction::Outgoing),
        };
        self.audit(LogEvent::WebSocketTerminated {
            web_socket_id: self.web_socket_id.clone(),
            close_code,
            close_text: exit.describe().to_string(),
            direction,
        });
    }

    fn mark_notified(&mut self) {
        if let Some(subscription) = self.subscription.as_mut() {
            subscription.last_notify = Instant::now();
        }
    }

    fn end_subscription(&mut self, why: &str) {
        self.pending.clear();
        if let Some(subscription) = self.subscription.take() {
            log::info!("Subscription {} of {} ended: {}", subscription.id, self.ctx.peer, why);
            self.fire_ended(subscription.id, why);
        }
    }

    fn fire_ended(&self, subscription_id: String, why: &str) {
        self.emit(ServerEvent::SubscriptionEnded {
            peer: self.ctx.peer.clone(),
            subscription_id,
            reason: why.to_string(),
        });
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn audit(&self, event: LogEvent) {
        if let Some(audit) = &self.ctx.audit {
            audit.record(&self.ctx.peer, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loggers::audit::MemoryAuditSink;
    use crate::configs::settings::LoggingSettings;
    use crate::protocol::NotifyEventResponse;
    use serde_json::json;
    use tokio::task::JoinHandle;

    struct Peer {
        tx: FrameSink,
        rx: FrameStream,
    }

    impl Peer {
        async fn send(&mut self, message: Message) {
            self.tx.send(Frame::Text(encode(&message).unwrap())).await.unwrap();
        }

        async fn send_text(&mut self, text: &str) {
            self.tx.send(Frame::Text(text.to_string())).await.unwrap();
        }

        async fn frame(&mut self) -> Option<Frame> {
            self.rx.next().await.map(|frame| frame.unwrap())
        }

        async fn recv(&mut self) -> Message {
            match self.frame().await {
                Some(Frame::Text(text)) => decode(&text).unwrap(),
                other => panic!("expected a message, got {other:?}"),
            }
        }

        async fn subscribe(&mut self, request: SubscribeRequest) -> SubscribeResponse {
            self.send(Message::Subscribe(request)).await;
            match self.recv().await {
                Message::SubscribeResponse(response) => response,
                other => panic!("expected subscribeResponse, got {other:?}"),
            }
        }

        async fn ack(&mut self, event: &NotifyEvent) {
            self.send(Message::EventResponse(NotifyEventResponse::ok(event.transaction_id.clone())))
                .await;
        }

        async fn recv_event(&mut self) -> NotifyEvent {
            match self.recv().await {
                Message::Event(event) => event,
                other => panic!("expected event, got {other:?}"),
            }
        }
    }

    struct Harness {
        peer: Peer,
        handle: EngineHandle,
        events: broadcast::Receiver<ServerEvent>,
        join: JoinHandle<EngineExit>,
        audit: Arc<MemoryAuditSink>,
    }

    fn start() -> Harness {
        let (events_tx, events) = broadcast::channel(256);
        let audit = Arc::new(MemoryAuditSink::new());
        let settings = LoggingSettings { element_id: "el".into(), agency_id: "ag".into(), ..Default::default() };
        let ctx = EngineContext {
            timings: EngineTimings::default(),
            peer: PeerIdentity::anonymous("127.0.0.1:40000".parse().unwrap()),
            events: events_tx,
            audit: Some(AuditLog::new(settings, audit.clone()).unwrap()),
        };
        let (engine, handle) = SubscriptionEngine::new(ctx, CancellationToken::new());
        let (ours, theirs) = Transport::pair();
        let join = tokio::spawn(engine.run(ours));
        let (tx, rx) = theirs.into_parts();
        Harness { peer: Peer { tx, rx }, handle, events, join, audit }
    }

    fn request(expires: Option<u32>, min_rate: Option<u32>) -> SubscribeRequest {
        let mut request = SubscribeRequest::new(RequestSubType::New);
        request.expires = expires;
        request.min_rate = min_rate;
        request
    }

    fn eido(id: &str, incident: &str) -> EidoDocument {
        EidoDocument::new(json!({ "$id": id, "incidentComponent": { "$id": incident } }))
    }

    fn ended_reasons(events: &mut broadcast::Receiver<ServerEvent>) -> Vec<String> {
        let mut reasons = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ServerEvent::SubscriptionEnded { reason, .. } = event {
                reasons.push(reason);
            }
        }
        reasons
    }

    #[tokio::test(start_paused = true)]
    async fn new_subscription_gets_fresh_id_and_clamped_timers() {
        let mut h = start();
        let first = h.peer.subscribe(request(Some(5), Some(1))).await;
        assert!(first.is_ok());
        let first_id = first.subscription_id.clone().unwrap();
        assert!(!first_id.is_empty());
        assert_eq!(first.expires, Some(15));
        assert_eq!(first.min_rate, Some(5));

        let zero = request(Some(0), None);
        let zero_request_id = zero.request_id.clone();
        h.peer.send(Message::Subscribe(zero)).await;
        // The earlier subscription is terminated before the new one is confirmed.
        match h.peer.recv().await {
            Message::Terminate(terminate) => {
                assert_eq!(terminate.subscription_id, first_id);
                h.peer
                    .send(Message::TerminateResponse(TerminateResponse::new(
                        Some(terminate.request_id),
                        Some(terminate.subscription_id),
                        StatusCode::Ok,
                    )))
                    .await;
            }
            other => panic!("expected terminate, got {other:?}"),
        }
        let second = match h.peer.recv().await {
            Message::SubscribeResponse(response) => response,
            other => panic!("expected subscribeResponse, got {other:?}"),
        };
        assert_eq!(second.request_id, Some(zero_request_id));
        assert_ne!(second.subscription_id.as_deref(), Some(first_id.as_str()));
        assert_eq!(second.expires, None);
        assert_eq!(second.min_rate, None);
        assert_eq!(ended_reasons(&mut h.events), vec![reason::SUPERSEDED.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_keeps_id_and_unknown_id_is_not_found() {
        let mut h = start();
        let created = h.peer.subscribe(request(Some(60), None)).await;
        let id = created.subscription_id.unwrap();

        let mut refresh = request(Some(60), None);
        refresh.subscription_id = Some(id.clone());
        let refreshed = h.peer.subscribe(refresh).await;
        assert!(refreshed.is_ok());
        assert_eq!(refreshed.subscription_id.as_deref(), Some(id.as_str()));
        assert_eq!(refreshed.expires, Some(60));

        let mut unknown = request(Some(60), None);
        unknown.subscription_id = Some("nope".into());
        let rejected = h.peer.subscribe(unknown).await;
        assert_eq!(rejected.status_code, 404);
        assert_eq!(rejected.subscription_id.as_deref(), Some("nope"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_resets_expiry_clock() {
        let mut h = start();
        let id = h.peer.subscribe(request(Some(15), None)).await.subscription_id.unwrap();
        let started = Instant::now();

        time::sleep(Duration::from_secs(10)).await;
        let mut refresh = request(Some(15), None);
        refresh.subscription_id = Some(id.clone());
        assert!(h.peer.subscribe(refresh).await.is_ok());

        match h.peer.recv().await {
            Message::Terminate(terminate) => assert_eq!(terminate.subscription_id, id),
            other => panic!("expected terminate, got {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_answers_and_closes() {
        let mut h = start();
        let id = h.peer.subscribe(request(None, None)).await.subscription_id.unwrap();

        h.peer
            .send(Message::Unsubscribe(UnsubscribeRequest { request_id: "u1".into(), subscription_id: "other".into() }))
            .await;
        match h.peer.recv().await {
            Message::UnsubscribeResponse(response) => assert_eq!(response.status_code, 481),
            other => panic!("unexpected {other:?}"),
        }

        h.peer
            .send(Message::Unsubscribe(UnsubscribeRequest { request_id: "u2".into(), subscription_id: id.clone() }))
            .await;
        match h.peer.recv().await {
            Message::UnsubscribeResponse(response) => {
                assert_eq!(response.status_code, 200);
                assert_eq!(response.request_id.as_deref(), Some("u2"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.peer.frame().await, Some(Frame::Close));
        assert_eq!(h.join.await.unwrap(), EngineExit::Closed);
        assert_eq!(ended_reasons(&mut h.events), vec![reason::UNSUBSCRIBED.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_get_bad_request() {
        let mut h = start();
        h.peer.send_text("this is not json").await;
        match h.peer.recv().await {
            Message::SubscribeResponse(response) => {
                assert_eq!(response.status_code, 400);
                assert_eq!(response.request_id, None);
            }
            other => panic!("unexpected {other:?}"),
        }

        h.peer.send_text(r#"{"unsubscribe":{"requestId":"r9","subscriptionId":7}}"#).await;
        match h.peer.recv().await {
            Message::UnsubscribeResponse(response) => {
                assert_eq!(response.status_code, 400);
                assert_eq!(response.request_id.as_deref(), Some("r9"));
                assert_eq!(response.subscription_id, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_subscription_only_sees_its_incident_in_one_batch() {
        let mut h = start();
        let mut single = SubscribeRequest::new(RequestSubType::Single);
        single.incident_id = Some("inc-A".into());
        let id = h.peer.subscribe(single).await.subscription_id.unwrap();

        h.handle.enqueue(eido("e1", "inc-A"));
        h.handle.enqueue(eido("e2", "inc-B"));
        h.handle.enqueue(eido("e3", "inc-A"));
        h.handle.enqueue_batch("someone-else", vec![eido("e4", "inc-A")]);

        let event = h.peer.recv_event().await;
        assert_eq!(event.subscription_id, id);
        let ids: Vec<_> = event.notification.iter().map(|e| e.id().unwrap().to_string()).collect();
        assert_eq!(ids, ["e1", "e3"]);
        h.peer.ack(&event).await;

        h.handle.enqueue_batch(&id, vec![eido("e5", "inc-A"), eido("e6", "inc-B")]);
        let event = h.peer.recv_event().await;
        assert_eq!(event.notification.len(), 1);
        assert_eq!(event.notification[0].id(), Some("e5"));
        h.peer.ack(&event).await;

        time::sleep(Duration::from_millis(500)).await;
        let delivered = h
            .audit
            .records()
            .into_iter()
            .filter(|record| matches!(record.event, LogEvent::EidoLogEvent { .. }))
            .count();
        assert_eq!(delivered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn single_without_incident_is_bad_request() {
        let mut h = start();
        let response = h.peer.subscribe(SubscribeRequest::new(RequestSubType::Single)).await;
        assert_eq!(response.status_code, 400);
        assert_eq!(response.subscription_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_batch_is_audited_once() {
        let mut h = start();
        h.peer.subscribe(request(None, None)).await;
        h.handle.enqueue(eido("e1", "inc-A"));
        h.handle.enqueue(eido("e2", "inc-A"));
        let event = h.peer.recv_event().await;
        assert_eq!(event.notification.len(), 2);

        time::sleep(Duration::from_secs(6)).await;
        let records = h.audit.records();
        let failures: Vec<_> = records
            .iter()
            .filter(|record| matches!(record.event, LogEvent::EidoTransmissionError { .. }))
            .collect();
        assert_eq!(failures.len(), 1);
        assert!(!records.iter().any(|record| matches!(record.event, LogEvent::EidoLogEvent { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alives_follow_min_rate_and_three_misses_end_subscription() {
        let mut h = start();
        h.peer.subscribe(request(None, Some(5))).await;
        let subscribed = Instant::now();

        let first = h.peer.recv_event().await;
        assert!(first.is_empty());
        let waited = subscribed.elapsed();
        assert!(waited > Duration::from_secs(5) && waited < Duration::from_secs(6));
        h.peer.ack(&first).await;

        for _ in 0..3 {
            let keep_alive = h.peer.recv_event().await;
            assert!(keep_alive.is_empty());
        }
        assert_eq!(h.peer.frame().await, Some(Frame::Close));
        assert_eq!(h.join.await.unwrap(), EngineExit::Closed);
        assert_eq!(ended_reasons(&mut h.events), vec![reason::KEEP_ALIVE_TIMEOUT.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_keep_alive_resets_missed_count() {
        let mut h = start();
        h.peer.subscribe(request(None, Some(5))).await;

        // Two misses, one ack, two misses: never three in a row.
        for acked in [false, false, true, false, false] {
            let keep_alive = h.peer.recv_event().await;
            if acked {
                h.peer.ack(&keep_alive).await;
            }
        }
        let keep_alive = h.peer.recv_event().await;
        h.peer.ack(&keep_alive).await;
        assert!(ended_reasons(&mut h.events).is_empty());
        assert!(!h.handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn acks_without_status_text_still_answer_keep_alives() {
        let mut h = start();
        h.peer.subscribe(request(None, Some(5))).await;

        for _ in 0..4 {
            let keep_alive = h.peer.recv_event().await;
            let minimal = format!(r#"{{"eventResponse":{{"transactionId":"{}","statusCode":200}}}}"#, keep_alive.transaction_id);
            h.peer.send_text(&minimal).await;
        }
        let keep_alive = h.peer.recv_event().await;
        h.peer.ack(&keep_alive).await;
        assert!(ended_reasons(&mut h.events).is_empty());
        assert!(!h.handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn late_ack_does_not_answer_the_next_keep_alive() {
        let mut h = start();
        h.peer.subscribe(request(None, Some(5))).await;

        let first = h.peer.recv_event().await;
        let _second = h.peer.recv_event().await;
        // Answers the first keep-alive while the second one is outstanding.
        h.peer.ack(&first).await;
        let _third = h.peer.recv_event().await;

        assert_eq!(h.peer.frame().await, Some(Frame::Close));
        assert_eq!(h.join.await.unwrap(), EngineExit::Closed);
        assert_eq!(ended_reasons(&mut h.events), vec![reason::KEEP_ALIVE_TIMEOUT.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_sends_one_terminate_and_closes() {
        let mut h = start();
        let id = h.peer.subscribe(request(Some(15), None)).await.subscription_id.unwrap();
        let subscribed = Instant::now();

        match h.peer.recv().await {
            Message::Terminate(terminate) => {
                assert_eq!(terminate.subscription_id, id);
                let elapsed = subscribed.elapsed();
                assert!(elapsed > Duration::from_secs(15) && elapsed < Duration::from_millis(15_300));
                h.peer
                    .send(Message::TerminateResponse(TerminateResponse::new(
                        Some(terminate.request_id),
                        Some(id),
                        StatusCode::Ok,
                    )))
                    .await;
            }
            other => panic!("expected terminate, got {other:?}"),
        }
        assert_eq!(h.peer.frame().await, Some(Frame::Close));
        assert_eq!(h.join.await.unwrap(), EngineExit::Closed);
        assert_eq!(ended_reasons(&mut h.events), vec![reason::EXPIRED.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn client_terminate_keeps_connection_open() {
        let mut h = start();
        let id = h.peer.subscribe(request(None, None)).await.subscription_id.unwrap();

        h.peer
            .send(Message::Terminate(TerminateRequest { request_id: "t1".into(), subscription_id: id }))
            .await;
        match h.peer.recv().await {
            Message::TerminateResponse(response) => assert_eq!(response.status_code, 200),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ended_reasons(&mut h.events), vec![reason::TERMINATED_BY_SUBSCRIBER.to_string()]);

        // Same connection, new subscription.
        assert!(h.peer.subscribe(request(None, None)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_sends_one_terminate_and_returns_without_answer() {
        let mut h = start();
        h.peer.subscribe(request(None, None)).await;

        let asked = Instant::now();
        h.handle.shutdown();
        assert!(matches!(h.peer.recv().await, Message::Terminate(_)));
        assert_eq!(h.join.await.unwrap(), EngineExit::Shutdown);
        assert!(asked.elapsed() <= Duration::from_millis(1100));
        assert_eq!(h.peer.frame().await, Some(Frame::Close));
        assert_eq!(h.peer.frame().await, None);
        assert_eq!(ended_reasons(&mut h.events), vec![reason::SHUTTING_DOWN.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_ends_subscription() {
        let mut h = start();
        h.peer.subscribe(request(None, None)).await;
        drop(h.peer);
        assert_eq!(h.join.await.unwrap(), EngineExit::PeerClosed);
        assert_eq!(ended_reasons(&mut h.events), vec![reason::CONNECTION_CLOSED.to_string()]);
        assert!(h.handle.is_closed());
    }
}
