mod config;
mod metrics;
mod net;
mod util;
mod world;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::session::SyncSession;
use crate::net::transport::SyncServer;
use crate::world::progression::QuestRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    info!("Tandem Sync Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = ServerConfig::load_or_default();
    if let Err(e) = config.validate() {
        anyhow::bail!("invalid configuration: {}", e);
    }
    info!(
        "Configuration loaded: {}:{}, tick_rate={}, interest_radius={}",
        config.bind_address, config.port, config.tick_rate, config.interest_radius
    );

    // Quest registry comes from game content; without one, every stage
    // update will be rejected as unknown
    let registry = match std::env::var("QUEST_REGISTRY") {
        Ok(path) => {
            let registry = QuestRegistry::load_from_file(&path)?;
            info!("Loaded {} quest hashes from {}", registry.len(), path);
            registry
        }
        Err(_) => {
            warn!("QUEST_REGISTRY not set; stage replication will reject all updates");
            QuestRegistry::default()
        }
    };

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    // Start metrics server on port 9090 (configurable via METRICS_PORT)
    let metrics_port: u16 = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9090);

    let metrics_clone = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
            error!("Metrics server error: {}", e);
        }
    });

    // The session owns all sync state; transport talks to it via channels
    let session = SyncSession::new(&config, registry, metrics.clone());
    let inbox = session.inbox_sender();
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    tokio::spawn(session.run(cmd_rx));

    let server = SyncServer::bind(&config, cmd_tx, inbox).await?;
    info!("Server ready on {}", server.local_addr()?);

    // Shutdown signal handler
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    // Run server with graceful shutdown
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    info!("Server stopped");
    Ok(())
}
