//! # HTTP Front End
//!
//! Axum routes for the notifier: the WebSocket upgrade on `ws_path` and the
//! retrieval channel below `eido_path`. The caller chooses how to listen
//! (plain TCP via [`serve`], or TLS via `axum-server`) and must provide
//! `ConnectInfo<SocketAddr>`.
//!
//! A TLS layer that authenticates clients attaches a [`TlsClientCredential`]
//! to each request; the router lifts it into the [`ClientCredential`]
//! extension the handlers read.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{CONTENT_TYPE, SEC_WEBSOCKET_PROTOCOL};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::middleware::map_request;
use axum::routing::get;
use axum::{Extension, Router};

use crate::core::dispatcher::Dispatcher;
use crate::core::peer::{ClientCredential, PeerIdentity, TlsClientCredential};
use crate::transport::axum_ws::from_axum;

/// The routes of `dispatcher`, already bound to it.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    let settings = dispatcher.settings();
    let eido_path = settings.eido_path.trim_end_matches('/').to_owned();
    Router::new()
        .route(&settings.ws_path, get(ws_handler))
        .route(&format!("{eido_path}/"), get(eido_handler))
        .route(&format!("{eido_path}/{{reference_id}}"), get(eido_handler))
        .layer(map_request(lift_tls_credential))
        .with_state(dispatcher)
}

async fn lift_tls_credential(mut request: Request) -> Request {
    let credential = request
        .extensions()
        .get::<TlsClientCredential>()
        .and_then(|tls| tls.0.clone());
    if let Some(credential) = credential {
        request.extensions_mut().insert(credential);
    }
    request
}

/// Serves `dispatcher` on a plain TCP listener until `shutdown` resolves.
/// The dispatcher itself is not shut down.
pub async fn serve<F>(listener: tokio::net::TcpListener, dispatcher: Arc<Dispatcher>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(dispatcher);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}

async fn ws_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    ConnectInfo(endpoint): ConnectInfo<SocketAddr>,
    credential: Option<Extension<ClientCredential>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = PeerIdentity::new(endpoint, credential.map(|Extension(c)| c));
    if dispatcher.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if !dispatcher.authorize(&peer) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let offered = dispatcher.settings().sub_protocol.clone();
    let sub_protocol = requested_protocols(&headers)
        .any(|p| p == offered)
        .then(|| offered.clone());
    if sub_protocol.is_none() {
        log::warn!("{} did not request sub-protocol {}", peer, offered);
    }

    ws.protocols([offered]).on_upgrade(move |socket| async move {
        dispatcher.serve_connection(from_axum(socket), peer, sub_protocol).await;
    })
}

async fn eido_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    ConnectInfo(endpoint): ConnectInfo<SocketAddr>,
    credential: Option<Extension<ClientCredential>>,
    uri: Uri,
) -> Response {
    let peer = PeerIdentity::new(endpoint, credential.map(|Extension(c)| c));
    if !dispatcher.authorize(&peer) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let answer = dispatcher.retrieve(uri.path(), peer).await;
    let status = StatusCode::from_u16(answer.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match answer.content_type {
        Some(content_type) => (status, [(CONTENT_TYPE, content_type)], answer.body).into_response(),
        None => status.into_response(),
    }
}

fn requested_protocols(headers: &HeaderMap) -> impl Iterator<Item = &str> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn splits_protocol_lists() {
        let mut headers = HeaderMap::new();
        headers.append(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat, emergency-ent1.0"));
        headers.append(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("other"));
        let protocols: Vec<&str> = requested_protocols(&headers).collect();
        assert_eq!(protocols, ["chat", "emergency-ent1.0", "other"]);
    }

    #[tokio::test]
    async fn tls_credential_becomes_client_credential() {
        let credential = ClientCredential::new("x509-sha256", "ab12");
        let mut request = Request::new(axum::body::Body::empty());
        request.extensions_mut().insert(TlsClientCredential(Some(credential.clone())));
        let lifted = lift_tls_credential(request).await;
        assert_eq!(lifted.extensions().get::<ClientCredential>(), Some(&credential));

        let mut anonymous = Request::new(axum::body::Body::empty());
        anonymous.extensions_mut().insert(TlsClientCredential(None));
        assert!(lift_tls_credential(anonymous).await.extensions().get::<ClientCredential>().is_none());
    }
}
