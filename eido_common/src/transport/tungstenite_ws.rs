//! Adapter for client-side sockets opened with tokio-tungstenite.

use futures_util::future::ready;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::{Frame, Transport, TransportError};

/// Wraps a connected tungstenite stream as a [`Transport`].
pub fn from_tungstenite<S>(socket: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();

    let sink = sink
        .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
        .with(|frame: Frame| {
            ready(Ok::<Message, TransportError>(match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Close => Message::Close(None),
            }))
        });

    let stream = stream.filter_map(|item| {
        ready(match item {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.as_str().to_owned()))),
            Ok(Message::Binary(bytes)) => Some(
                String::from_utf8(bytes.to_vec())
                    .map(Frame::Text)
                    .map_err(|e| TransportError::InvalidFrame(e.to_string())),
            ),
            Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
            Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
        })
    });

    Transport::new(Box::pin(sink), Box::pin(stream))
}
