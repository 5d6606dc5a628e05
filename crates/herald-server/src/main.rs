//! # Herald Server
//!
//! Main binary for one Herald node. Wires configuration, the record store,
//! the federation layer, the messaging core, the delivery workers, and the
//! HTTP boundary, then serves until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use herald_api::{AppState, build_router};
use herald_db::Database;
use herald_federation::registry::NodeRegistry;
use herald_federation::{HttpDiscovery, HttpTransport, OutboundTransport, RemoteDiscovery};
use herald_messaging::{DeliveryWorker, IdentityResolver, MessageLifecycle};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Arc::new(herald_common::config::load()?);

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting Herald v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Node domain: {}", config.server.domain);

    // === Record store ===
    let db = match &config.database.url {
        Some(url) => Database::connect_postgres(url, &config.database).await?,
        None => {
            tracing::warn!(
                "No database URL configured — running with the in-memory store (lite mode); \
                 state will not survive a restart"
            );
            Database::in_memory()
        }
    };

    // === Federation layer ===
    let discovery: Arc<dyn RemoteDiscovery> = Arc::new(HttpDiscovery::new(
        Duration::from_secs(config.federation.discovery_timeout_secs),
    ));
    let transport: Arc<dyn OutboundTransport> = Arc::new(HttpTransport::new(
        Duration::from_secs(config.federation.transport_timeout_secs),
    ));
    let registry = Arc::new(NodeRegistry::new(
        db.nodes.clone(),
        discovery.clone(),
        config.federation.offline_threshold,
    ));

    // === Messaging core ===
    let resolver = Arc::new(IdentityResolver::new(
        db.identities.clone(),
        registry.clone(),
        discovery,
        config.server.domain.clone(),
        config.federation.identity_freshness(),
    ));
    let lifecycle = Arc::new(MessageLifecycle::new(
        db.messages.clone(),
        db.tasks.clone(),
        db.identities.clone(),
        resolver.clone(),
        config.limits.clone(),
        &config.federation,
    ));

    // === Delivery workers ===
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handles = Vec::new();
    if config.server.federation_enabled {
        for _ in 0..config.federation.worker_count.max(1) {
            let worker = Arc::new(DeliveryWorker::new(
                db.tasks.clone(),
                db.messages.clone(),
                db.identities.clone(),
                lifecycle.clone(),
                registry.clone(),
                transport.clone(),
                config.federation.clone(),
            ));
            worker_handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
        }
        tracing::info!(
            "Spawned {} delivery worker(s)",
            config.federation.worker_count.max(1)
        );
    } else {
        tracing::warn!("Federation disabled — outbound delivery workers not started");
    }

    // === HTTP boundary ===
    let state = AppState {
        db,
        lifecycle,
        resolver,
        registry,
        config: config.clone(),
    };
    let router = build_router(state);
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);

    tracing::info!("API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the workers and let in-flight task processing finish.
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("Herald stopped");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
