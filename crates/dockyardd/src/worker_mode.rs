//! Worker mode — joins registries and runs their containers.
//!
//! A host may join several clusters; each gets its own store under
//! `<data_dir>/workers/<cluster>/`. `run` starts one agent per joined
//! cluster, all sharing a CPU sampler and a shutdown token.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use dockyard_core::{ClusterConfig, OsCrypto};
use dockyard_state::StateStore;
use dockyard_worker::{DockerEngine, HttpRegistryLink, WorkerAgent, WorkerStore, cpu, enroll};

const DB_FILE: &str = "worker.redb";

fn open_store(dir: &Path) -> anyhow::Result<WorkerStore> {
    std::fs::create_dir_all(dir)?;
    let db_path = dir.join(DB_FILE);
    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening worker store {}", db_path.display()))?;
    Ok(WorkerStore::new(store))
}

/// Enroll with a registry and persist the credentials.
pub async fn join(
    config: &ClusterConfig,
    registry: &str,
    master_key: &str,
    name: &str,
    endpoint: Option<String>,
) -> anyhow::Result<()> {
    let link = HttpRegistryLink::new(registry);
    let identity = enroll(&link, master_key, name, registry, endpoint).await?;

    let dir = config.worker_dir(&identity.cluster);
    open_store(&dir)?.save_identity(&identity)?;
    info!(
        worker = %identity.name,
        cluster = %identity.cluster,
        path = ?dir,
        "joined cluster"
    );
    Ok(())
}

/// Clusters with a worker store under `data_dir`.
fn joined_clusters(config: &ClusterConfig) -> anyhow::Result<Vec<String>> {
    let root = config.cluster.data_dir.join("workers");
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut clusters = Vec::new();
    for entry in std::fs::read_dir(&root)? {
        let entry = entry?;
        if entry.path().join(DB_FILE).exists() {
            clusters.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    clusters.sort();
    Ok(clusters)
}

pub async fn run(config: ClusterConfig, cluster: Option<String>) -> anyhow::Result<()> {
    info!("Dockyard daemon starting in worker mode");

    let clusters = match cluster {
        Some(cluster) => vec![cluster],
        None => joined_clusters(&config)?,
    };
    if clusters.is_empty() {
        anyhow::bail!(
            "no joined clusters under {}; run `dockyardd worker join` first",
            config.cluster.data_dir.display()
        );
    }

    let shutdown = CancellationToken::new();
    let cpu = cpu::spawn_sampler(config.cpu_sample_interval(), shutdown.clone());

    let mut handles = Vec::with_capacity(clusters.len());
    for cluster in &clusters {
        let store = open_store(&config.worker_dir(cluster))?;
        let identity = store
            .load_identity()
            .with_context(|| format!("cluster {cluster}"))?;
        let agent = WorkerAgent::new(
            DockerEngine::new(config.worker.engine.clone()),
            HttpRegistryLink::new(&identity.host),
            store,
            Arc::new(OsCrypto),
            config.clone(),
            cpu.clone(),
            shutdown.clone(),
        )?;
        handles.push(tokio::spawn(async move { agent.run().await }));
    }
    info!(clusters = ?clusters, "worker agents running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
    info!("shutdown signal received");
    shutdown.cancel();

    for handle in handles {
        let _ = handle.await;
    }
    info!("Dockyard worker stopped");
    Ok(())
}
