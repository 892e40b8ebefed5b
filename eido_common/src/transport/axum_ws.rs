//! Adapter for server-side sockets upgraded by axum.

use axum::extract::ws::{Message, WebSocket};
use futures_util::future::ready;
use futures_util::{SinkExt, StreamExt};

use super::{Frame, Transport, TransportError};

/// Wraps an upgraded axum socket as a [`Transport`].
///
/// Ping and pong frames are answered by axum itself and never surface here.
/// Binary frames are accepted when they hold UTF-8 text.
pub fn from_axum(socket: WebSocket) -> Transport {
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
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
        })
    });

    Transport::new(Box::pin(sink), Box::pin(stream))
}
