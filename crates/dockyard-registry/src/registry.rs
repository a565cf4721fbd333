//! The `Registry` handle.
//!
//! Cheap to clone; every clone shares the same store, artifact directory
//! and in-memory scheduling state. Operations are split across modules by
//! concern: [`crate::credentials`], [`crate::heartbeat`],
//! [`crate::placement`] and [`crate::deploy`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dockyard_core::{ClusterConfig, Crypto};
use dockyard_state::paths::registry as paths;
use dockyard_state::{ArtifactStore, StateStore};

use crate::error::{RegistryError, RegistryResult};
use crate::state::RegistryState;
use crate::worker::WorkerStatus;

pub(crate) struct RegistryInner {
    pub(crate) store: StateStore,
    pub(crate) artifacts: ArtifactStore,
    pub(crate) crypto: Arc<dyn Crypto>,
    pub(crate) config: ClusterConfig,
    pub(crate) name: String,
    pub(crate) state: Mutex<RegistryState>,
    pub(crate) shutdown: CancellationToken,
}

/// Point-in-time view of the cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub name: String,
    pub workers: Vec<WorkerStatus>,
    pub pending: usize,
    pub abandoned: usize,
}

#[derive(Clone)]
pub struct Registry {
    pub(crate) inner: Arc<RegistryInner>,
}

impl Registry {
    /// Write the registry identity into an empty store.
    ///
    /// Returns the generated master key.
    pub fn install(store: &StateStore, crypto: &dyn Crypto, name: &str) -> RegistryResult<String> {
        let name = dockyard_core::names::worker(name)?;
        let key = crypto.create_key();
        if !store.create_file(paths::REGISTRY_KEY, key.as_bytes())? {
            return Err(RegistryError::AlreadyInstalled);
        }
        store.write_file(paths::REGISTRY_NAME, name.as_bytes())?;
        store.create_dir(paths::WORKERS)?;
        store.create_dir(paths::CLIENTS)?;
        store.create_dir(paths::APPLICATIONS)?;
        info!(registry = %name, "registry installed");
        Ok(key)
    }

    /// Open an installed registry.
    pub fn open(
        store: StateStore,
        artifacts: ArtifactStore,
        crypto: Arc<dyn Crypto>,
        config: ClusterConfig,
    ) -> RegistryResult<Self> {
        let name = store
            .read_string(paths::REGISTRY_NAME)?
            .ok_or(RegistryError::NotInstalled)?;
        if !store.exists(paths::REGISTRY_KEY)? {
            return Err(RegistryError::NotInstalled);
        }
        info!(registry = %name, "registry opened");
        Ok(Self {
            inner: Arc::new(RegistryInner {
                store,
                artifacts,
                crypto,
                config,
                name,
                state: Mutex::new(RegistryState::default()),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Cluster name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Token cancelled on shutdown; placements run on child tokens.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn shutdown(&self) {
        info!("registry shutting down");
        self.inner.shutdown.cancel();
    }

    pub async fn cluster_status(&self) -> ClusterStatus {
        let state = self.inner.state.lock().await;
        ClusterStatus {
            name: self.inner.name.clone(),
            workers: state.workers().iter().map(|w| w.status()).collect(),
            pending: state.pending.len(),
            abandoned: state.abandoned.len(),
        }
    }

    /// Drop abandoned placements older than `older_than`.
    pub async fn gc_abandoned(&self, older_than: Duration) -> usize {
        let cutoff = tokio::time::Instant::now()
            .checked_sub(older_than)
            .unwrap_or_else(tokio::time::Instant::now);
        let removed = self.inner.state.lock().await.gc_abandoned(cutoff);
        if removed > 0 {
            debug!(removed, "abandoned placements collected");
        }
        removed
    }

    /// Whether `instance` is still waiting for its worker's report.
    pub async fn is_pending(&self, instance: &str) -> bool {
        self.inner.state.lock().await.pending.contains_key(instance)
    }
}
