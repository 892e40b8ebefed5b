//! Reply correlation for requests sent over an asynchronous connection.
//!
//! The protocol has at most one outstanding request of each kind per
//! connection, so replies are matched by message kind. The sender registers a
//! waiter *before* writing its request; the receive task completes it when the
//! reply arrives. Each waiter is a one-shot channel, so a reply can never be
//! handed to a later request of the same kind by mistake once the earlier
//! waiter is gone.
//!
//! A waiter may also name the id it answers (the `transactionId` of a
//! notification). A reply carrying a different id is stale and is refused;
//! a reply carrying no id at all still matches on kind.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::{classify, Message, MessageKind, RecoveredFields};

/// Why no reply was obtained.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// The bound elapsed first.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// The connection went away, or the waiter was replaced.
    #[error("connection closed")]
    Closed,
    /// Shutdown pre-empted the wait.
    #[error("cancelled by shutdown")]
    Cancelled,
}

/// A reply as far as a waiter cares: its kind, the id it answers and its
/// status, when the peer sent them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// `eventResponse` or `terminateResponse`.
    pub kind: MessageKind,
    /// `transactionId` of an event response, `requestId` of a terminate response.
    pub id: Option<String>,
    /// `statusCode`.
    pub status_code: Option<u16>,
    /// `statusText`.
    pub status_text: Option<String>,
}

impl Reply {
    /// The reply carried by a fully decoded message. `None` for any message
    /// that is not a reply the engine waits on.
    pub fn from_message(message: Message) -> Option<Self> {
        match message {
            Message::EventResponse(response) => Some(Self {
                kind: MessageKind::EventResponse,
                id: Some(response.transaction_id),
                status_code: Some(response.status_code),
                status_text: Some(response.status_text),
            }),
            Message::TerminateResponse(response) => Some(Self {
                kind: MessageKind::TerminateResponse,
                id: response.request_id,
                status_code: Some(response.status_code),
                status_text: Some(response.status_text),
            }),
            _ => None,
        }
    }

    /// Salvages a reply from a frame that failed strict decoding, going by its
    /// kind alone. Whatever fields are readable are kept.
    pub fn recover(text: &str) -> Option<Self> {
        let kind = classify(text)?;
        if !matches!(kind, MessageKind::EventResponse | MessageKind::TerminateResponse) {
            return None;
        }
        let fields = RecoveredFields::recover(text);
        let id = match kind {
            MessageKind::EventResponse => fields.transaction_id,
            _ => fields.request_id,
        };
        Some(Self { kind, id, status_code: fields.status_code, status_text: fields.status_text })
    }
}

struct Waiter {
    expected_id: Option<String>,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Waiters {
    by_kind: HashMap<MessageKind, Waiter>,
    closed: bool,
}

/// Outstanding replies of one connection.
#[derive(Default)]
pub struct PendingReplies {
    waiters: Mutex<Waiters>,
}

impl PendingReplies {
    /// No outstanding replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in the next reply of `kind`. When `expected_id` is
    /// given, a reply naming another id is refused. An earlier waiter for the
    /// same kind is dropped and observes [`ReplyError::Closed`].
    pub fn expect(&self, kind: MessageKind, expected_id: Option<String>) -> ReplyWaiter {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        if !waiters.closed {
            waiters.by_kind.insert(kind, Waiter { expected_id, tx });
        }
        ReplyWaiter { kind, rx }
    }

    /// Hands `reply` to the waiter for its kind. Gives the reply back when
    /// nobody is waiting for it or it answers a different id; the waiter
    /// then stays in place.
    pub fn complete(&self, reply: Reply) -> Result<(), Reply> {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(waiter) = waiters.by_kind.get(&reply.kind) else {
            return Err(reply);
        };
        let stale = match (&waiter.expected_id, &reply.id) {
            (Some(expected), Some(id)) => expected != id,
            _ => false,
        };
        if stale {
            return Err(reply);
        }
        match waiters.by_kind.remove(&reply.kind) {
            Some(waiter) => waiter.tx.send(reply),
            None => Err(reply),
        }
    }

    /// Fails every current and future waiter with [`ReplyError::Closed`].
    pub fn close(&self) {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        waiters.closed = true;
        waiters.by_kind.clear();
    }
}

/// The receiving end of one expected reply.
#[derive(Debug)]
pub struct ReplyWaiter {
    kind: MessageKind,
    rx: oneshot::Receiver<Reply>,
}

impl ReplyWaiter {
    /// The kind of reply awaited.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Waits for the reply for at most `bound`.
    pub async fn wait(self, bound: Duration) -> Result<Reply, ReplyError> {
        match tokio::time::timeout(bound, self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ReplyError::Closed),
            Err(_) => Err(ReplyError::TimedOut(bound)),
        }
    }
}
