//! dockyard-state — persistent store for Dockyard registries and workers.
//!
//! Backed by [redb](https://docs.rs/redb), the [`StateStore`] models a
//! small directory hierarchy: files hold raw bytes or JSON records, and
//! directories exist either explicitly or as the parents of files. The
//! registry and every worker each own one store; [`paths`] describes
//! their layouts.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────┐    ┌─────────────────────────┐
//! │ StateStore (redb)            │    │ ArtifactStore (fs)      │
//! │  files: path → bytes         │    │  <a>/<v>/source         │
//! │  dirs:  path → ()            │    │  <a>/<v>/source.partial │
//! └──────────────────────────────┘    └─────────────────────────┘
//! ```
//!
//! `create_file` and `create_dir` are check-and-insert inside a single
//! write transaction, which is what the registry uses for its version
//! reservation and upgrade lock.
//!
//! Both stores are `Clone` + `Send` + `Sync` and can be shared across
//! async tasks.

pub mod artifacts;
pub mod error;
pub mod paths;
pub mod store;
pub mod tables;
pub mod types;

pub use artifacts::{ArtifactInfo, ArtifactStore};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
