//! dockyard-registry — the scheduling core of a Dockyard cluster.
//!
//! The registry is the source of truth. It:
//!
//! - Enrolls workers and clients and authenticates every request
//! - Tracks workers through their heartbeats (load, liveness, mailbox)
//! - Places instances on the least-loaded live worker, re-placing them
//!   when a worker goes silent before confirming
//! - Stores pushed image artifacts and drives per-env upgrades
//!
//! # Architecture
//!
//! ```text
//! Registry (Clone, Arc inner)
//!   ├── StateStore          keys, versions, envs, active placements
//!   ├── ArtifactStore       pushed image bytes
//!   └── Mutex<RegistryState>
//!       ├── workers         ChildWorker + Mailbox, first-seen order
//!       ├── pending         instance → oneshot waiting on a report
//!       └── abandoned       timed-out placements kept for late reports
//! ```
//!
//! A start travels: `upgrade` → `start` → worker mailbox → `ping` response
//! → worker runs the container → `report_started` → oneshot resolves.

pub mod credentials;
pub mod deploy;
pub mod error;
pub mod heartbeat;
pub mod placement;
pub mod registry;
pub mod state;
pub mod worker;

pub use error::{RegistryError, RegistryResult};
pub use placement::Placement;
pub use registry::{ClusterStatus, Registry};
pub use state::PlacementOutcome;
pub use worker::{ChildWorker, Mailbox, WorkerStatus};
