//! Records persisted as JSON files in the Dockyard store.
//!
//! Single-value files (`latest`, `image-id`, keys) are stored as raw UTF-8
//! and have no type here.

use serde::{Deserialize, Serialize};

/// Metadata written once when a version is pushed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionRecord {
    pub application: String,
    pub version: String,
    pub image_id: String,
    /// Artifact size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the artifact.
    pub sha256: String,
    /// Unix timestamp (seconds).
    pub pushed_at: u64,
}

/// Upgrade-in-flight marker for one (application, env).
///
/// Its existence is the upgrade lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DanglingMarker {
    /// `latest` at the time the upgrade began; `None` on first upgrade.
    pub previous: Option<String>,
    pub target: String,
    pub started_at: u64,
}

/// One confirmed instance of a version in an env.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivePlacement {
    pub instance: String,
    pub worker: String,
    pub port: u16,
    pub placed_at: u64,
}

/// What a worker knows about an instance it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceRecord {
    pub instance: String,
    pub application: String,
    pub version: String,
    pub env: String,
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
