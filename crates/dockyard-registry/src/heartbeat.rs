//! Worker heartbeats.
//!
//! A heartbeat authenticates the worker, refreshes its load and liveness,
//! and hands back everything in its mailbox. Each heartbeat also arms a
//! timeout check: if no newer heartbeat arrives within `ping_timeout`, the
//! worker is marked down and every start it has not confirmed is re-placed.

use tracing::{debug, warn};

use dockyard_core::{PingRequest, PingResponse};

use crate::error::RegistryResult;
use crate::registry::Registry;

impl Registry {
    pub async fn ping(&self, request: &PingRequest) -> RegistryResult<PingResponse> {
        let name = self.verify_worker(&request.name, &request.key)?;

        let (seq, messages) = {
            let mut state = self.inner.state.lock().await;
            let worker = state.upsert_worker(&name);
            let seq = worker.touch(request.cpu_usage);
            if request.endpoint.is_some() {
                worker.endpoint.clone_from(&request.endpoint);
            }
            (seq, worker.mailbox.drain_all())
        };

        debug!(
            worker = %name,
            seq,
            cpu = request.cpu_usage,
            messages = messages.len(),
            "heartbeat"
        );

        self.arm_timeout(name, seq);
        Ok(PingResponse::from_messages(messages))
    }

    fn arm_timeout(&self, worker: String, seq: u64) {
        let registry = self.clone();
        let timeout = self.inner.config.ping_timeout();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let lost = registry
                        .inner
                        .state
                        .lock()
                        .await
                        .expire_worker(&worker, seq);
                    if let Some(lost) = lost {
                        warn!(
                            %worker,
                            replaced = lost.len(),
                            "worker missed its heartbeat, marked down"
                        );
                    }
                }
            }
        });
    }
}
