//! Error types for dockyard-core.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid {kind} name: {value:?}")]
    InvalidName { kind: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ParseConfig(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    SerializeConfig(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
