//! Registry error types.

use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("version {application}:{version} already exists")]
    VersionExists { application: String, version: String },

    #[error("worker already exists: {0}")]
    WorkerExists(String),

    #[error("client already exists: {0}")]
    ClientExists(String),

    #[error("upgrade already in progress for {application}/{env}")]
    UpgradeInProgress { application: String, env: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    InvalidName(#[from] dockyard_core::CoreError),

    #[error("registry is not installed")]
    NotInstalled,

    #[error("registry is already installed")]
    AlreadyInstalled,

    #[error("placement gave up after {0} attempts")]
    PlacementExhausted(u32),

    #[error("placement cancelled")]
    Cancelled,

    #[error("artifact upload failed: {0}")]
    Artifact(String),

    #[error("state store error: {0}")]
    State(#[from] dockyard_state::StateError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;
