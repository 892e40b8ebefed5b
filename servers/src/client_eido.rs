use anyhow::Result;
use eido_common::ingestors::{ClientEvent, ConnectionSupervisor};

mod eido_logic;
use eido_logic::{config, logger, signals, store};

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    // --- Phase 1: Configuration & logging ---
    let config = config::load_client_config()?;
    logger::setup_logging(&config.log_dir(), config.log_level(), "client_eido")?;

    // --- Phase 2: Supervisor ---
    let (supervisor, mut events) = ConnectionSupervisor::start(config.supervisor_config(), config.connector()?)?;
    log::info!("Subscribing to {}", supervisor.uri());

    // --- Phase 3: Receive until a shutdown signal ---
    let shutdown = signals::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Some(ClientEvent::EidoReceived { eido, uri }) => {
                    log::info!("EIDO {:?} (incident {:?}) from {}", eido.id(), eido.incident_id(), uri);
                    if let Some(dir) = &config.save_dir {
                        match store::save_eido(dir, &eido) {
                            Ok(path) => log::debug!("Saved to {}", path.display()),
                            Err(e) => log::error!("Failed to save EIDO: {:#}", e),
                        }
                    }
                }
                Some(ClientEvent::ConnectionState { connected, uri }) => {
                    log::info!("{} {}", if connected { "Connected to" } else { "Disconnected from" }, uri);
                }
                Some(ClientEvent::SubscriptionState { subscribed, uri, reason }) => {
                    if subscribed {
                        log::info!("Subscribed to {}", uri);
                    } else {
                        log::warn!("Subscription to {} ended: {}", uri, reason.as_deref().unwrap_or("unknown"));
                    }
                }
                None => break,
            },
        }
    }

    // --- Phase 4: Shutdown ---
    if !supervisor.shutdown().await {
        log::warn!("Supervisor did not stop cleanly");
    }
    log::info!("Shutdown complete.");
    Ok(())
}
