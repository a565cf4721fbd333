//! dockyard-core — types shared by the registry, the worker agent and the
//! daemon.
//!
//! - **`protocol`** — mailbox messages, heartbeat bodies, route and header names
//! - **`names`** — sanitization of application/version/env/worker names
//! - **`crypto`** — the `Crypto` capability (keys, ids, free ports)
//! - **`config`** — `dockyard.toml` cluster configuration

pub mod config;
pub mod crypto;
pub mod error;
pub mod names;
pub mod protocol;

pub use config::ClusterConfig;
pub use crypto::{Crypto, OsCrypto};
pub use error::{CoreError, CoreResult};
pub use protocol::*;
