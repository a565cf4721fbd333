//! Worker-local persistent state.
//!
//! One store per cluster the worker has joined: its credentials, the
//! registry host, and a record for every instance it has started.

use tracing::warn;

use dockyard_state::paths::worker as paths;
use dockyard_state::{InstanceRecord, StateStore};

use crate::error::{WorkerError, WorkerResult};

/// Credentials and addressing persisted by `join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub key: String,
    pub name: String,
    /// Cluster (registry) name.
    pub cluster: String,
    /// Registry `host:port`.
    pub host: String,
    /// Public hostname announced in heartbeats.
    pub endpoint: Option<String>,
}

#[derive(Clone)]
pub struct WorkerStore {
    store: StateStore,
}

impl WorkerStore {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Persist the identity. A store can be joined once.
    pub fn save_identity(&self, identity: &WorkerIdentity) -> WorkerResult<()> {
        if !self.store.create_file(paths::KEY, identity.key.as_bytes())? {
            let cluster = self
                .store
                .read_string(paths::CLUSTER)?
                .unwrap_or_else(|| identity.cluster.clone());
            return Err(WorkerError::AlreadyJoined(cluster));
        }
        self.store.write_file(paths::NAME, identity.name.as_bytes())?;
        self.store
            .write_file(paths::CLUSTER, identity.cluster.as_bytes())?;
        self.store.write_file(paths::HOST, identity.host.as_bytes())?;
        if let Some(endpoint) = &identity.endpoint {
            self.store.write_file(paths::ENDPOINT, endpoint.as_bytes())?;
        }
        Ok(())
    }

    pub fn load_identity(&self) -> WorkerResult<WorkerIdentity> {
        let read = |path: &str| -> WorkerResult<String> {
            self.store.read_string(path)?.ok_or(WorkerError::NotJoined)
        };
        Ok(WorkerIdentity {
            key: read(paths::KEY)?,
            name: read(paths::NAME)?,
            cluster: read(paths::CLUSTER)?,
            host: read(paths::HOST)?,
            endpoint: self.store.read_string(paths::ENDPOINT)?,
        })
    }

    /// Record an instance unless a record already exists.
    pub fn put_instance_if_absent(&self, record: &InstanceRecord) -> WorkerResult<bool> {
        if !self.store.create_dir(&paths::instance(&record.instance))? {
            return Ok(false);
        }
        self.store.write_file(
            &paths::instance_application(&record.instance),
            record.application.as_bytes(),
        )?;
        self.store.write_file(
            &paths::instance_version(&record.instance),
            record.version.as_bytes(),
        )?;
        self.store.write_file(
            &paths::instance_env(&record.instance),
            record.env.as_bytes(),
        )?;
        Ok(true)
    }

    /// Every complete instance record. Partial records are skipped.
    pub fn list_instances(&self) -> WorkerResult<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        for instance in self.store.list(paths::INSTANCES)? {
            let application = self
                .store
                .read_string(&paths::instance_application(&instance))?;
            let version = self.store.read_string(&paths::instance_version(&instance))?;
            let env = self.store.read_string(&paths::instance_env(&instance))?;
            match (application, version, env) {
                (Some(application), Some(version), Some(env)) => records.push(InstanceRecord {
                    instance,
                    application,
                    version,
                    env,
                }),
                _ => warn!(%instance, "skipping incomplete instance record"),
            }
        }
        Ok(records)
    }

    /// Forget an instance. Returns false when there was nothing to forget.
    pub fn remove_instance(&self, instance: &str) -> WorkerResult<bool> {
        Ok(self.store.delete_tree(&paths::instance(instance))? > 0)
    }
}
