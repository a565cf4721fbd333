//! dockyard-worker — the agent that runs containers for a Dockyard registry.
//!
//! A worker joins one or more clusters. For each, it heartbeats the
//! registry, executes the start/stop messages it receives through the
//! container engine, and reports the ports of instances it started.
//!
//! - **`agent`** — heartbeat loop, start/stop reconciliation, recovery
//! - **`engine`** — `ContainerEngine` trait and the docker CLI driver
//! - **`link`** — `RegistryLink` trait and its HTTP implementation
//! - **`store`** — credentials and instance records, per cluster
//! - **`cpu`** — `/proc/stat` load sampler

pub mod agent;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod link;
pub mod store;

pub use agent::{StartOutcome, WorkerAgent, enroll};
pub use engine::{ArtifactStream, ContainerEngine, ContainerState, DockerEngine, RunSpec};
pub use error::{EngineError, EngineResult, WorkerError, WorkerResult};
pub use link::{HttpRegistryLink, RegistryLink};
pub use store::{WorkerIdentity, WorkerStore};
