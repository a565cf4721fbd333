//! dockyard.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster: ClusterSection,
    pub registry: RegistrySection,
    pub worker: WorkerSection,
}

/// Settings shared by the registry and its workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterSection {
    /// Registry HTTP port.
    pub port: u16,
    /// Root directory for registry and worker state.
    pub data_dir: PathBuf,
    /// Heartbeat cadence.
    pub ping_interval_ms: u64,
    /// Liveness window; must exceed `ping_interval_ms`.
    pub ping_timeout_ms: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: PathBuf::from("/var/lib/dockyard"),
            ping_interval_ms: 5_000,
            ping_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistrySection {
    /// Give up a placement after this many attempts. Unbounded when absent.
    pub max_placement_attempts: Option<u32>,
    /// Stop the previous version's instances once an upgrade completes.
    pub drain_previous: bool,
    /// How long abandoned placements are remembered for late reports.
    pub abandoned_ttl_secs: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            max_placement_attempts: None,
            drain_previous: true,
            abandoned_ttl_secs: 3_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSection {
    /// Container engine binary.
    pub engine: String,
    pub cpu_sample_interval_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            cpu_sample_interval_ms: 10_000,
        }
    }
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the heartbeat protocol cannot work with.
    pub fn validate(&self) -> CoreResult<()> {
        let cluster = &self.cluster;
        if cluster.ping_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "ping_interval_ms must be positive".to_string(),
            ));
        }
        if cluster.ping_timeout_ms <= cluster.ping_interval_ms {
            return Err(CoreError::InvalidConfig(format!(
                "ping_timeout_ms ({}) must exceed ping_interval_ms ({})",
                cluster.ping_timeout_ms, cluster.ping_interval_ms
            )));
        }
        if self.registry.max_placement_attempts == Some(0) {
            return Err(CoreError::InvalidConfig(
                "max_placement_attempts must be at least 1".to_string(),
            ));
        }
        if self.worker.engine.trim().is_empty() {
            return Err(CoreError::InvalidConfig("worker.engine is empty".to_string()));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.ping_timeout_ms)
    }

    pub fn cpu_sample_interval(&self) -> Duration {
        Duration::from_millis(self.worker.cpu_sample_interval_ms)
    }

    pub fn abandoned_ttl(&self) -> Duration {
        Duration::from_secs(self.registry.abandoned_ttl_secs)
    }

    /// Directory holding the registry database and artifacts.
    pub fn registry_dir(&self) -> PathBuf {
        self.cluster.data_dir.join("registry")
    }

    /// Directory holding the worker state for one cluster.
    pub fn worker_dir(&self, cluster_name: &str) -> PathBuf {
        self.cluster.data_dir.join("workers").join(cluster_name)
    }
}
