//! Observer events published by the dispatcher and its engines.
//!
//! Events go out on a `tokio::sync::broadcast` channel; applications call
//! `Dispatcher::subscribe_events` and read at their own pace. A lagging
//! reader loses the oldest events, never blocks a connection.

use std::net::SocketAddr;

use crate::core::peer::PeerIdentity;
use crate::eido::EidoDocument;
use crate::protocol::RequestSubType;

/// Reasons reported when a subscription ends.
pub mod reason {
    /// The subscriber unsubscribed.
    pub const UNSUBSCRIBED: &str = "Unsubscribed";
    /// The subscription lifetime elapsed without a refresh.
    pub const EXPIRED: &str = "Expired";
    /// Keep-alives went unanswered too many times in a row.
    pub const KEEP_ALIVE_TIMEOUT: &str = "Empty Event Notify Response Timeout";
    /// The subscriber closed the connection.
    pub const CONNECTION_CLOSED: &str = "Client Connection Closed";
    /// The connection failed.
    pub const CONNECTION_ERROR: &str = "Connection Error";
    /// The subscriber sent a terminate.
    pub const TERMINATED_BY_SUBSCRIBER: &str = "Terminated By Subscriber";
    /// The notifier is shutting down.
    pub const SHUTTING_DOWN: &str = "Shutting Down";
    /// A new subscribe replaced the subscription on the same connection.
    pub const SUPERSEDED: &str = "Superseded";
}

/// Something that happened on the notifier side.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A WebSocket was accepted.
    ConnectionAccepted {
        /// Who connected.
        peer: PeerIdentity,
        /// The sub-protocol agreed during the handshake.
        sub_protocol: Option<String>,
    },
    /// A WebSocket closed and its engine finished.
    ConnectionEnded {
        /// Who disconnected.
        peer: PeerIdentity,
    },
    /// A subscription was created.
    NewSubscription {
        /// Subscriber.
        peer: PeerIdentity,
        /// The id assigned to it.
        subscription_id: String,
        /// `new` or `single`.
        request_sub_type: RequestSubType,
        /// The incident followed by a `single` subscription.
        incident_id: Option<String>,
        /// Lifetime after clamping; 0 never expires.
        expires: u32,
        /// Keep-alive interval after clamping; 0 disables it.
        min_rate: u32,
    },
    /// A subscription ended.
    SubscriptionEnded {
        /// Subscriber.
        peer: PeerIdentity,
        /// The id it had.
        subscription_id: String,
        /// One of the [`reason`] constants.
        reason: String,
    },
    /// A text frame arrived.
    MessageReceived {
        /// Sender.
        endpoint: SocketAddr,
        /// The frame text.
        text: String,
    },
    /// A text frame was written.
    MessageSent {
        /// Receiver.
        endpoint: SocketAddr,
        /// The frame text.
        text: String,
    },
    /// A retrieval request arrived.
    RetrievalRequested {
        /// Requester.
        peer: PeerIdentity,
        /// Full request path.
        path: String,
    },
    /// A retrieval request was answered.
    RetrievalResponded {
        /// Requester.
        peer: PeerIdentity,
        /// HTTP status sent.
        status: u16,
        /// The EIDO returned, if any.
        eido: Option<EidoDocument>,
    },
}
