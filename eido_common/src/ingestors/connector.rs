//! How the supervisor opens a connection.
//!
//! [`WsConnector`] dials a real WebSocket with tokio-tungstenite, optionally
//! with its own rustls configuration (custom roots, a client certificate). Any
//! `Fn(&str, &str) -> BoxFuture<...>` is a connector too, which is how tests
//! hand the supervisor in-process transports.

use futures_util::future::BoxFuture;

use crate::transport::{Transport, TransportError};

/// Opens transports to a notifier.
pub trait Connector: Send + Sync + 'static {
    /// Connects to `uri`, requesting `sub_protocol` during the handshake.
    fn connect(&self, uri: &str, sub_protocol: &str) -> BoxFuture<'static, Result<Transport, TransportError>>;
}

impl<F> Connector for F
where
    F: Fn(&str, &str) -> BoxFuture<'static, Result<Transport, TransportError>> + Send + Sync + 'static,
{
    fn connect(&self, uri: &str, sub_protocol: &str) -> BoxFuture<'static, Result<Transport, TransportError>> {
        self(uri, sub_protocol)
    }
}

#[cfg(feature = "client")]
pub use ws::WsConnector;

#[cfg(feature = "client")]
mod ws {
    use std::sync::Arc;

    use futures_util::future::BoxFuture;
    use rustls::ClientConfig;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::handshake::client::Request;
    use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    use super::Connector;
    use crate::transport::tungstenite_ws::from_tungstenite;
    use crate::transport::{Transport, TransportError};

    /// Dials `ws://` and `wss://` URIs. Without a TLS configuration, servers
    /// are validated against the platform roots and no client certificate is
    /// presented.
    #[derive(Debug, Clone, Default)]
    pub struct WsConnector {
        tls: Option<Arc<ClientConfig>>,
    }

    impl WsConnector {
        /// A connector using the default TLS setup.
        pub fn new() -> Self {
            Self::default()
        }

        /// A connector that uses `config` for `wss://` URIs, e.g. one built by
        /// [`client_config`](crate::transport::tls::client_config) with a
        /// client certificate.
        pub fn with_tls(config: Arc<ClientConfig>) -> Self {
            Self { tls: Some(config) }
        }

        /// Whether a custom TLS configuration is set.
        pub fn has_tls_config(&self) -> bool {
            self.tls.is_some()
        }
    }

    impl Connector for WsConnector {
        fn connect(&self, uri: &str, sub_protocol: &str) -> BoxFuture<'static, Result<Transport, TransportError>> {
            let request = handshake_request(uri, sub_protocol);
            let tls = self.tls.clone().map(tokio_tungstenite::Connector::Rustls);
            Box::pin(async move {
                let request = request?;
                let target = request.uri().to_string();
                let (socket, response) = tokio_tungstenite::connect_async_tls_with_config(request, None, false, tls)
                    .await
                    .map_err(|e| TransportError::Connect(e.to_string()))?;
                log::debug!("Handshake with {} answered {}", target, response.status());
                Ok(from_tungstenite(socket))
            })
        }
    }

    pub(super) fn handshake_request(uri: &str, sub_protocol: &str) -> Result<Request, TransportError> {
        let mut request = uri
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let protocol = HeaderValue::from_str(sub_protocol).map_err(|e| TransportError::Connect(e.to_string()))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);
        Ok(request)
    }

}
