//! Worker agent — reconciles the registry's mailbox with local containers.
//!
//! ```text
//!            every ping_interval
//!   ┌──────────────────────────────────────┐
//!   │ ping(name, key, cpu) ──► registry    │
//!   │        ◄── {start: [...], stop: [...]}
//!   └──────┬───────────────────────┬───────┘
//!          ▼ spawn per message     ▼
//!        start()                 stop()
//!   pull+load image if absent   rm --force
//!   run if not already running  forget record
//!   persist record, report port
//! ```
//!
//! Starts are idempotent per instance id: a running container is left
//! alone, and a second start while the first is in flight is dropped.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dockyard_core::{
    ClusterConfig, Crypto, PingRequest, PingResponse, StartRequest, StopRequest, env_vars, names,
};
use dockyard_state::InstanceRecord;

use crate::engine::{ContainerEngine, ContainerState, RunSpec};
use crate::error::{WorkerError, WorkerResult};
use crate::link::RegistryLink;
use crate::store::{WorkerIdentity, WorkerStore};

const PORT_ATTEMPTS: usize = 8;

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A container for this instance is already running.
    AlreadyRunning,
    /// Another start for this instance is in progress.
    InFlight,
    Started { port: u16 },
}

/// Enroll with the registry. The caller persists the returned identity in
/// the store of the cluster it names.
pub async fn enroll<L: RegistryLink>(
    link: &L,
    master_key: &str,
    name: &str,
    host: &str,
    endpoint: Option<String>,
) -> WorkerResult<WorkerIdentity> {
    let name = names::worker(name)?;
    let creds = link.create_worker(master_key, &name).await?;
    info!(worker = %name, cluster = %creds.name, "enrolled with registry");
    Ok(WorkerIdentity {
        key: creds.key,
        name,
        cluster: creds.name,
        host: host.to_string(),
        endpoint,
    })
}

struct AgentInner<E, L> {
    engine: E,
    link: L,
    store: WorkerStore,
    identity: WorkerIdentity,
    crypto: Arc<dyn Crypto>,
    config: ClusterConfig,
    cpu: watch::Receiver<f64>,
    in_flight: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
}

pub struct WorkerAgent<E, L> {
    inner: Arc<AgentInner<E, L>>,
}

impl<E, L> Clone for WorkerAgent<E, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Marks an instance as in flight until dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    instance: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, instance: &str) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance.to_string());
        inserted.then(|| Self {
            set,
            instance: instance.to_string(),
        })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.instance);
    }
}

impl<E: ContainerEngine, L: RegistryLink> WorkerAgent<E, L> {
    /// Build an agent from a joined store.
    pub fn new(
        engine: E,
        link: L,
        store: WorkerStore,
        crypto: Arc<dyn Crypto>,
        config: ClusterConfig,
        cpu: watch::Receiver<f64>,
        shutdown: CancellationToken,
    ) -> WorkerResult<Self> {
        let identity = store.load_identity()?;
        Ok(Self {
            inner: Arc::new(AgentInner {
                engine,
                link,
                store,
                identity,
                crypto,
                config,
                cpu,
                in_flight: Mutex::new(HashSet::new()),
                shutdown,
            }),
        })
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.inner.identity
    }

    pub fn store(&self) -> &WorkerStore {
        &self.inner.store
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Make sure `request.instance` is running, then report its port.
    pub async fn start(&self, request: &StartRequest) -> WorkerResult<StartOutcome> {
        let outcome = self.launch(request).await?;
        if let StartOutcome::Started { port } = outcome {
            let instance = names::instance(&request.instance)?;
            self.report(&instance, port).await?;
            info!(
                application = %request.application,
                version = %request.version,
                env = %request.env,
                %instance,
                port,
                "instance started"
            );
        }
        Ok(outcome)
    }

    async fn report(&self, instance: &str, port: u16) -> WorkerResult<()> {
        let identity = &self.inner.identity;
        self.inner
            .link
            .report_started(&identity.name, &identity.key, instance, port)
            .await
    }

    /// Run the container for `request.instance` and persist its record.
    async fn launch(&self, request: &StartRequest) -> WorkerResult<StartOutcome> {
        let application = names::application(&request.application)?;
        let version = names::version(&request.version)?;
        let env = names::env(&request.env)?;
        let instance = names::instance(&request.instance)?;

        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight, &instance) else {
            debug!(%instance, "start already in flight");
            return Ok(StartOutcome::InFlight);
        };

        let engine = &self.inner.engine;
        let identity = &self.inner.identity;
        let image = format!("{application}:{version}");

        if !engine.has_image(&image).await? {
            info!(%image, "pulling image from registry");
            let artifact = self
                .inner
                .link
                .pull(&identity.name, &identity.key, &application, &version)
                .await?;
            engine.load_image(artifact).await?;
            info!(%image, "image loaded");
        }

        match engine.container_state(&instance).await? {
            ContainerState::Running => {
                debug!(%instance, "container already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            ContainerState::Stopped => {
                info!(%instance, "removing stopped container");
                engine.remove(&instance, false).await?;
            }
            ContainerState::Missing => {}
        }

        let (internal_port, external_port) = self.allocate_ports()?;
        let spec = RunSpec {
            env: self.container_env(
                &application,
                &version,
                &env,
                &instance,
                internal_port,
                external_port,
            ),
            image,
            name: instance.clone(),
            internal_port,
            external_port,
        };
        engine.run(&spec).await?;

        self.inner.store.put_instance_if_absent(&InstanceRecord {
            instance,
            application,
            version,
            env,
        })?;
        Ok(StartOutcome::Started {
            port: external_port,
        })
    }

    /// Remove the container and forget the instance. Unknown instances
    /// are not an error.
    pub async fn stop(&self, request: &StopRequest) -> WorkerResult<()> {
        let instance = names::instance(&request.instance)?;
        let engine = &self.inner.engine;

        if engine.container_state(&instance).await? != ContainerState::Missing {
            engine.remove(&instance, true).await?;
        }
        let forgotten = self.inner.store.remove_instance(&instance)?;
        info!(%instance, forgotten, "instance stopped");
        Ok(())
    }

    /// Restart every persisted instance. Returns how many were started.
    pub async fn recover(&self) -> WorkerResult<usize> {
        let records = self.inner.store.list_instances()?;
        let mut started = 0;
        for record in records {
            let request = StartRequest {
                application: record.application,
                version: record.version,
                env: record.env,
                instance: record.instance,
                image_id: String::new(),
            };
            let port = match self.launch(&request).await {
                Ok(StartOutcome::Started { port }) => port,
                Ok(_) => continue,
                Err(e) => {
                    warn!(instance = %request.instance, error = %e, "recovery start failed");
                    continue;
                }
            };
            started += 1;
            let instance = request.instance;
            match self.report(&instance, port).await {
                Ok(()) => info!(%instance, port, "instance recovered"),
                Err(WorkerError::Registry { status: 404, .. }) => {
                    info!(%instance, port, "instance recovered, registry no longer tracks it");
                }
                Err(e) => warn!(%instance, error = %e, "recovery report failed"),
            }
        }
        info!(started, "recovery complete");
        Ok(started)
    }

    fn allocate_ports(&self) -> WorkerResult<(u16, u16)> {
        let crypto = &self.inner.crypto;
        let internal = crypto.free_port().map_err(WorkerError::Port)?;
        for _ in 0..PORT_ATTEMPTS {
            let external = crypto.free_port().map_err(WorkerError::Port)?;
            if external != internal {
                return Ok((internal, external));
            }
        }
        Err(WorkerError::Port(io::Error::new(
            io::ErrorKind::AddrInUse,
            "no second distinct free port",
        )))
    }

    fn container_env(
        &self,
        application: &str,
        version: &str,
        env: &str,
        instance: &str,
        internal_port: u16,
        external_port: u16,
    ) -> Vec<(String, String)> {
        let identity = &self.inner.identity;
        [
            (env_vars::PORT, internal_port.to_string()),
            (env_vars::APPLICATION, application.to_string()),
            (env_vars::INTERNAL_PORT, internal_port.to_string()),
            (env_vars::EXTERNAL_PORT, external_port.to_string()),
            (env_vars::VERSION, version.to_string()),
            (env_vars::INSTANCE, instance.to_string()),
            (env_vars::CLUSTER_NAME, identity.cluster.clone()),
            (env_vars::WORKER, identity.name.clone()),
            (env_vars::REGISTRY, identity.host.clone()),
            (env_vars::ENV, env.to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
    }

    // ── Heartbeat ──────────────────────────────────────────────────

    /// Send one heartbeat and dispatch the returned messages.
    pub async fn ping_once(&self) -> WorkerResult<Vec<JoinHandle<()>>> {
        let identity = &self.inner.identity;
        let request = PingRequest {
            name: identity.name.clone(),
            key: identity.key.clone(),
            cpu_usage: *self.inner.cpu.borrow(),
            endpoint: identity.endpoint.clone(),
        };
        let response = self.inner.link.ping(&request).await?;
        if !response.is_empty() {
            debug!(
                starts = response.start.len(),
                stops = response.stop.len(),
                "mailbox delivered"
            );
        }
        Ok(self.dispatch(response))
    }

    fn dispatch(&self, response: PingResponse) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(response.start.len() + response.stop.len());

        for request in response.start {
            let agent = self.clone();
            let shutdown = self.inner.shutdown.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(instance = %request.instance, "start cancelled by shutdown");
                    }
                    result = agent.start(&request) => {
                        if let Err(e) = result {
                            error!(instance = %request.instance, error = %e, "start failed");
                        }
                    }
                }
            }));
        }

        for request in response.stop {
            let agent = self.clone();
            let shutdown = self.inner.shutdown.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(instance = %request.instance, "stop cancelled by shutdown");
                    }
                    result = agent.stop(&request) => {
                        if let Err(e) = result {
                            error!(instance = %request.instance, error = %e, "stop failed");
                        }
                    }
                }
            }));
        }

        handles
    }

    /// Recover persisted instances, then heartbeat until shutdown.
    pub async fn run(&self) {
        let identity = &self.inner.identity;
        let interval = self.inner.config.ping_interval();
        info!(
            worker = %identity.name,
            cluster = %identity.cluster,
            registry = %identity.host,
            ?interval,
            "worker agent started"
        );

        let recovery = {
            let agent = self.clone();
            let shutdown = self.inner.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = agent.recover() => {
                        if let Err(e) = result {
                            error!(error = %e, "recovery failed");
                        }
                    }
                }
            })
        };

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.ping_once().await {
                        warn!(worker = %identity.name, error = %e, "heartbeat failed");
                    }
                }
            }
        }

        let _ = recovery.await;
        info!(worker = %identity.name, "worker agent stopped");
    }
}
