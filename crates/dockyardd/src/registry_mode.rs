//! Registry mode — owns the cluster state and serves the registry API.
//!
//! In this mode, the daemon:
//! 1. Opens the registry store and artifact directory under `data_dir`
//! 2. Serves the HTTP API
//! 3. Logs a cluster status line every `ping_interval` and garbage-collects
//!    abandoned placements
//! 4. On Ctrl-C, cancels in-flight placements and drains connections

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use dockyard_core::{ClusterConfig, OsCrypto};
use dockyard_registry::Registry;
use dockyard_state::{ArtifactStore, StateStore};

const DB_FILE: &str = "registry.redb";
const ARTIFACTS_DIR: &str = "artifacts";

/// Install a fresh registry and print its master key.
pub fn init(config: &ClusterConfig, name: &str) -> anyhow::Result<()> {
    let dir = config.registry_dir();
    std::fs::create_dir_all(&dir)?;
    let db_path = dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "registry store opened");

    let master_key = Registry::install(&store, &OsCrypto, name)?;
    println!("{master_key}");
    Ok(())
}

pub async fn serve(config: ClusterConfig) -> anyhow::Result<()> {
    info!("Dockyard daemon starting in registry mode");

    let dir = config.registry_dir();
    std::fs::create_dir_all(&dir)?;
    let db_path = dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "registry store opened");
    let artifacts = ArtifactStore::open(dir.join(ARTIFACTS_DIR))?;

    let port = config.cluster.port;
    let registry = Registry::open(store, artifacts, Arc::new(OsCrypto), config)?;

    // ── Background maintenance ─────────────────────────────────

    let maintenance = {
        let registry = registry.clone();
        tokio::spawn(async move { maintenance_loop(registry).await })
    };

    // ── API server ─────────────────────────────────────────────

    let router = dockyard_api::build_router(registry.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, registry = %registry.name(), "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown = registry.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            shutdown.shutdown();
        })
        .await?;

    let _ = maintenance.await;
    info!("Dockyard registry stopped");
    Ok(())
}

async fn maintenance_loop(registry: Registry) {
    let token = registry.shutdown_token();
    let ttl = registry.config().abandoned_ttl();
    let mut ticker = tokio::time::interval(registry.config().ping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let status = registry.cluster_status().await;
                let up = status.workers.iter().filter(|w| w.up).count();
                info!(
                    workers = status.workers.len(),
                    up,
                    pending = status.pending,
                    abandoned = status.abandoned,
                    "cluster status"
                );
                for worker in &status.workers {
                    debug!(
                        worker = %worker.name,
                        up = worker.up,
                        cpu = worker.cpu_usage,
                        mailbox = worker.mailbox_depth,
                        last_seen = %worker.last_seen_at,
                        "worker status"
                    );
                }
                registry.gc_abandoned(ttl).await;
            }
        }
    }
}
