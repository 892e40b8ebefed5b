//! # Transport Module
//!
//! The frame-level connection both ends of the protocol run on. A
//! [`Transport`] is a boxed sink of outbound [`Frame`]s paired with a boxed
//! stream of inbound ones, so the subscription engine and the supervisor never
//! see which WebSocket library sits underneath.
//!
//! ## Contained Modules:
//!
//! - **`axum_ws`**: adapter for server sockets accepted by axum (feature `server`).
//! - **`tungstenite_ws`**: adapter for client sockets opened with
//!   tokio-tungstenite (feature `client`).
//! - **`tls`**: rustls configuration from PEM files, client certificate
//!   verification and the acceptor that records client credentials.
//!
//! [`Transport::pair`] builds two connected in-process ends, used by tests and
//! by anything that wants to run the protocol without a socket.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::pin::Pin;
use std::time::Duration;

use futures_channel::mpsc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;

/// Server sockets accepted by axum.
#[cfg(feature = "server")]
pub mod axum_ws;
/// Client sockets opened with tokio-tungstenite.
#[cfg(feature = "client")]
pub mod tungstenite_ws;
/// TLS configuration and client certificates.
#[cfg(any(feature = "server", feature = "client"))]
pub mod tls;

/// One application-level frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text frame carrying one encoded message.
    Text(String),
    /// The peer is closing, or we want to.
    Close,
}

/// Errors raised by the frame transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection is gone.
    #[error("Connection closed")]
    Closed,
    /// A send did not complete in time.
    #[error("Send timed out after {0:?}")]
    SendTimeout(Duration),
    /// The underlying WebSocket library reported an error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    /// Opening the connection failed.
    #[error("Connect failed: {0}")]
    Connect(String),
    /// A frame arrived that cannot be represented as text.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;

/// Inbound half of a connection. The stream ends when the peer goes away.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// A bidirectional frame connection.
pub struct Transport {
    sink: FrameSink,
    stream: FrameStream,
}

impl Transport {
    /// Joins an outbound and an inbound half into one connection.
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }

    /// Splits the connection so reading and writing can live in separate tasks.
    pub fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }

    /// Two in-process ends wired back to back.
    ///
    /// Dropping one end finishes the other end's stream, the same way a
    /// socket closing does.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, a_rx) = mpsc::unbounded::<Frame>();
        let (b_tx, b_rx) = mpsc::unbounded::<Frame>();
        (Self::channel_end(a_tx, b_rx), Self::channel_end(b_tx, a_rx))
    }

    fn channel_end(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Transport {
        let sink = tx.sink_map_err(|_| TransportError::Closed);
        let stream = rx.map(Ok::<Frame, TransportError>);
        Transport::new(Box::pin(sink), Box::pin(stream))
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_delivers_frames_both_ways() {
        let (left, right) = Transport::pair();
        let (mut left_tx, mut left_rx) = left.into_parts();
        let (mut right_tx, mut right_rx) = right.into_parts();

        left_tx.send(Frame::Text("ping".into())).await.unwrap();
        assert_eq!(right_rx.next().await.unwrap().unwrap(), Frame::Text("ping".into()));

        right_tx.send(Frame::Close).await.unwrap();
        assert_eq!(left_rx.next().await.unwrap().unwrap(), Frame::Close);
    }

    #[tokio::test]
    async fn dropping_one_end_finishes_the_other() {
        let (left, right) = Transport::pair();
        drop(left);
        let (mut tx, mut rx) = right.into_parts();
        assert!(rx.next().await.is_none());
        assert!(matches!(tx.send(Frame::Close).await, Err(TransportError::Closed)));
    }
}
