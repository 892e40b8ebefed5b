use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use eido_common::core::http;
use eido_common::loggers::{AuditLog, LocalAuditSink};
use eido_common::retrieve::{EidoRetrieval, NoRetrieval};
use eido_common::transport::tls::{self, CredentialAcceptor};
use eido_common::{Dispatcher, ServerEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

mod eido_logic;
use eido_logic::{config, console, logger, retrieval::DirectoryRetrieval, signals};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    // --- Phase 1: Configuration & logging ---
    let config = config::load_server_config()?;
    logger::setup_logging(&config.log_dir(), config.log_level(), "server_eido")?;

    // --- Phase 2: Dispatcher ---
    let retrieval: Arc<dyn EidoRetrieval> = match &config.eido_dir {
        Some(dir) => {
            log::info!("Serving EIDO retrieval from {}", dir.display());
            Arc::new(DirectoryRetrieval::new(dir))
        }
        None => Arc::new(NoRetrieval),
    };
    let mut dispatcher = Dispatcher::new(config.server_settings(), retrieval)?;
    if let Some(audit_dir) = &config.audit_dir {
        let sink = LocalAuditSink::open("server_eido", audit_dir)
            .with_context(|| format!("opening audit log in {}", audit_dir.display()))?;
        log::info!("Audit records go to {}", sink.path().display());
        dispatcher = dispatcher.with_audit(AuditLog::new(config.logging_settings(), Arc::new(sink))?);
    }
    let client_auth = config.client_auth()?;
    if let Some(auth) = &client_auth {
        log::info!(
            "Client certificates verified against {} ({})",
            auth.ca_path.display(),
            if auth.required { "required" } else { "optional" }
        );
    }
    dispatcher = dispatcher.with_auth(config.auth_policy());
    let dispatcher = Arc::new(dispatcher);
    tokio::spawn(log_events(dispatcher.subscribe_events()));

    // --- Phase 3: Listener ---
    let bind_address = config.bind_address.unwrap_or_else(|| [0, 0, 0, 0].into());
    let addr = SocketAddr::new(bind_address, config.port.unwrap_or(9443));
    let handle = axum_server::Handle::new();
    let app = http::router(Arc::clone(&dispatcher)).into_make_service_with_connect_info::<SocketAddr>();
    let mut server = match config.tls_paths() {
        Some((cert_path, key_path)) => {
            let server_tls = tls::server_config(&cert_path, &key_path, client_auth.as_ref())
                .with_context(|| format!("loading TLS configuration from {}", cert_path.display()))?;
            let acceptor = CredentialAcceptor::new(RustlsConfig::from_config(Arc::new(server_tls)));
            log::info!("Notifier listening on wss://{}{}", addr, dispatcher.settings().ws_path);
            tokio::spawn(axum_server::bind(addr).acceptor(acceptor).handle(handle.clone()).serve(app))
        }
        None => {
            log::info!("Notifier listening on ws://{}{}", addr, dispatcher.settings().ws_path);
            tokio::spawn(axum_server::bind(addr).handle(handle.clone()).serve(app))
        }
    };

    // --- Phase 4: Operator console ---
    let (quit_tx, mut quit_rx) = mpsc::channel(1);
    let console_handle = tokio::spawn(console::run(Arc::clone(&dispatcher), quit_tx));

    // Wait for shutdown signal
    tokio::select! {
        _ = signals::shutdown_signal() => {}
        Some(()) = quit_rx.recv() => {
            log::info!("Quit requested from the console.");
        }
        result = &mut server => {
            dispatcher.shutdown().await;
            result??;
            anyhow::bail!("Listener stopped unexpectedly");
        }
    }

    // --- Phase 5: Shutdown ---
    // Subscriptions are terminated before the listener is released.
    if !dispatcher.shutdown().await {
        log::warn!("Some connections did not close in time");
    }
    handle.graceful_shutdown(Some(Duration::from_secs(1)));
    console_handle.abort();
    server.await??;

    log::info!("Shutdown complete.");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(ServerEvent::NewSubscription { peer, subscription_id, request_sub_type, incident_id, expires, min_rate }) => {
                log::info!(
                    "New subscription {} from {} ({:?}, incident {:?}, expires {}s, min rate {}s)",
                    subscription_id,
                    peer,
                    request_sub_type,
                    incident_id,
                    expires,
                    min_rate
                );
            }
            Ok(ServerEvent::SubscriptionEnded { peer, subscription_id, reason }) => {
                log::info!("Subscription {} from {} ended: {}", subscription_id, peer, reason);
            }
            Ok(ServerEvent::RetrievalResponded { peer, status, .. }) => {
                log::info!("Retrieval for {} answered {}", peer, status);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Event log fell behind; {} event(s) skipped", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
