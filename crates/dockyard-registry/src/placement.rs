//! Placement — choosing a worker for an instance and waiting for it to run.
//!
//! ```text
//!   start(app, version, env)
//!     │
//!     ├─ no worker up ──▶ sleep(ping_interval) ──┐
//!     │                                          │
//!     ├─ pick least-loaded worker                │
//!     ├─ new instance id, StartRequest → mailbox │
//!     └─ await oneshot                           │
//!          ├─ Started{port} ──▶ Placement        │
//!          └─ WorkerLost ────────────────────────┘
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dockyard_core::{StartRequest, names};
use dockyard_state::paths::registry as paths;
use dockyard_state::{ActivePlacement, epoch_secs};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::{Registry, RegistryInner};
use crate::state::PlacementOutcome;

/// A confirmed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub instance: String,
    pub worker: String,
    pub port: u16,
}

/// Removes a pending start when its waiter goes away early.
struct PendingGuard {
    inner: Arc<RegistryInner>,
    instance: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.try_lock() {
            state.forget_pending(&self.instance);
            return;
        }
        // Contended: finish the cleanup on the runtime.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            let instance = std::mem::take(&mut self.instance);
            handle.spawn(async move {
                inner.state.lock().await.forget_pending(&instance);
            });
        }
    }
}

impl Registry {
    /// Place one instance of `application:version` in `env`.
    ///
    /// Retries until a worker confirms, the configured attempt limit is
    /// reached, or `cancel` fires.
    pub async fn start(
        &self,
        application: &str,
        version: &str,
        env: &str,
        cancel: &CancellationToken,
    ) -> RegistryResult<Placement> {
        let image_id = self
            .inner
            .store
            .read_string(&paths::image_id(application, version))?
            .ok_or_else(|| RegistryError::NotFound(format!("version {application}:{version}")))?;

        let interval = self.inner.config.ping_interval();
        let max_attempts = self.inner.config.registry.max_placement_attempts;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }
            attempt += 1;
            if let Some(max) = max_attempts.filter(|&max| attempt > max) {
                warn!(%application, %version, %env, attempts = max, "placement exhausted");
                return Err(RegistryError::PlacementExhausted(max));
            }

            let request = StartRequest {
                application: application.to_string(),
                version: version.to_string(),
                env: env.to_string(),
                instance: self.inner.crypto.create_id(),
                image_id: image_id.clone(),
            };
            let instance = request.instance.clone();

            let enqueued = {
                let mut state = self.inner.state.lock().await;
                let worker = state.select_worker().map(|w| w.name.clone());
                match worker {
                    Some(worker) => state
                        .enqueue_start(&worker, request)
                        .map(|rx| (worker, rx)),
                    None => None,
                }
            };

            let Some((worker, rx)) = enqueued else {
                warn!(
                    %application,
                    %version,
                    %env,
                    attempt,
                    retry_in = ?interval,
                    "no workers available, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
                    _ = tokio::time::sleep(interval) => {}
                }
                continue;
            };

            info!(%application, %version, %env, %worker, %instance, attempt, "start queued");
            let _guard = PendingGuard {
                inner: self.inner.clone(),
                instance: instance.clone(),
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(RegistryError::Cancelled),
                outcome = rx => outcome,
            };

            match outcome {
                Ok(PlacementOutcome::Started { worker, port }) => {
                    info!(
                        %application,
                        %version,
                        %env,
                        %worker,
                        %instance,
                        port,
                        "instance placed"
                    );
                    return Ok(Placement {
                        instance,
                        worker,
                        port,
                    });
                }
                Ok(PlacementOutcome::WorkerLost) | Err(_) => {
                    warn!(
                        %application,
                        %version,
                        %env,
                        %worker,
                        %instance,
                        "worker lost before confirming, re-placing"
                    );
                }
            }
        }
    }

    /// A worker reports that `instance` is running on `port`.
    ///
    /// `worker` is the authenticated reporter.
    pub async fn report_started(
        &self,
        worker: &str,
        instance: &str,
        port: u16,
    ) -> RegistryResult<()> {
        let instance = names::instance(instance)?;
        let mut state = self.inner.state.lock().await;

        if let Some(pending) = state.pending.remove(&instance) {
            if pending.worker != worker {
                warn!(
                    %instance,
                    assigned = %pending.worker,
                    reporter = %worker,
                    "start reported by another worker"
                );
            }
            debug!(%instance, worker = %pending.worker, port, "pending start resolved");
            let _ = pending.tx.send(PlacementOutcome::Started {
                worker: pending.worker,
                port,
            });
            return Ok(());
        }

        let Some(abandoned) = state.abandoned.remove(&instance) else {
            drop(state);
            return self.refresh_placement(worker, &instance, port);
        };
        drop(state);

        let req = &abandoned.request;
        info!(
            %instance,
            worker = %abandoned.worker,
            application = %req.application,
            version = %req.version,
            env = %req.env,
            port,
            "late start report for abandoned instance, recording it"
        );
        self.record_placement(
            &req.application,
            &req.env,
            &req.version,
            &Placement {
                instance: instance.clone(),
                worker: abandoned.worker.clone(),
                port,
            },
        )
    }

    /// A restarted worker re-reports an instance it already runs. Update
    /// the recorded port, or fail if no env tracks the instance any more.
    fn refresh_placement(&self, worker: &str, instance: &str, port: u16) -> RegistryResult<()> {
        let Some(path) = self.find_active_instance(worker, instance)? else {
            warn!(%instance, %worker, "start reported for unknown instance");
            return Err(RegistryError::UnknownInstance(instance.to_string()));
        };
        let store = &self.inner.store;
        let Some(mut record) = store.get_json::<ActivePlacement>(&path)? else {
            return Err(RegistryError::UnknownInstance(instance.to_string()));
        };
        if record.port != port {
            info!(%instance, %worker, old_port = record.port, port, "instance port changed");
            record.port = port;
            store.put_json(&path, &record)?;
        }
        Ok(())
    }

    /// Store path of `worker`'s active record for `instance`, if any.
    fn find_active_instance(
        &self,
        worker: &str,
        instance: &str,
    ) -> RegistryResult<Option<String>> {
        let store = &self.inner.store;
        for application in store.list(paths::APPLICATIONS)? {
            for env in store.list(&paths::envs(&application))? {
                for version in store.list(&paths::active_versions(&application, &env))? {
                    let path =
                        paths::active_instance(&application, &env, &version, worker, instance);
                    if store.exists(&path)? {
                        return Ok(Some(path));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Persist a confirmed placement under the env's active versions.
    pub(crate) fn record_placement(
        &self,
        application: &str,
        env: &str,
        version: &str,
        placement: &Placement,
    ) -> RegistryResult<()> {
        let record = ActivePlacement {
            instance: placement.instance.clone(),
            worker: placement.worker.clone(),
            port: placement.port,
            placed_at: epoch_secs(),
        };
        let path = paths::active_instance(
            application,
            env,
            version,
            &placement.worker,
            &placement.instance,
        );
        self.inner.store.put_json(&path, &record)?;
        Ok(())
    }
}
