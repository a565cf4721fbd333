//! Error types for dockyard-worker.

use std::io;

use thiserror::Error;

use dockyard_core::CoreError;
use dockyard_state::StateError;

pub type EngineResult<T> = Result<T, EngineError>;
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Failures of the container engine subprocess.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("image artifact stream failed: {0}")]
    Stream(#[source] io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("registry answered {status}: {message}")]
    Registry { status: u16, message: String },

    #[error("registry request failed: {0}")]
    Http(String),

    #[error("invalid registry response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("worker has not joined a cluster")]
    NotJoined,

    #[error("worker already joined cluster {0}")]
    AlreadyJoined(String),

    #[error("no free port: {0}")]
    Port(#[source] io::Error),
}
