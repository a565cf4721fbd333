//! The registry's in-memory scheduling state.
//!
//! Everything here lives behind one `tokio::sync::Mutex` in
//! [`crate::Registry`]; none of these methods await.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use dockyard_core::{MailboxMessage, StartRequest, StopRequest};

use crate::worker::ChildWorker;

/// How a pending placement ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementOutcome {
    /// The worker reported the instance running on `port`.
    Started { worker: String, port: u16 },
    /// The worker stopped heartbeating before confirming.
    WorkerLost,
}

/// A start request delivered (or queued) but not yet confirmed.
#[derive(Debug)]
pub struct PendingStart {
    pub request: StartRequest,
    pub worker: String,
    pub tx: oneshot::Sender<PlacementOutcome>,
}

/// A placement given up on. Kept so a late report can still be recorded.
#[derive(Debug, Clone)]
pub struct AbandonedStart {
    pub request: StartRequest,
    pub worker: String,
    pub abandoned_at: Instant,
}

#[derive(Debug, Default)]
pub struct RegistryState {
    /// Workers in first-seen order.
    workers: Vec<ChildWorker>,
    index: HashMap<String, usize>,
    pub pending: HashMap<String, PendingStart>,
    pub abandoned: HashMap<String, AbandonedStart>,
}

impl RegistryState {
    pub fn workers(&self) -> &[ChildWorker] {
        &self.workers
    }

    pub fn worker(&self, name: &str) -> Option<&ChildWorker> {
        self.index.get(name).map(|&i| &self.workers[i])
    }

    pub fn worker_mut(&mut self, name: &str) -> Option<&mut ChildWorker> {
        self.index.get(name).map(|&i| &mut self.workers[i])
    }

    /// Fetch a worker, registering it on first sight.
    pub fn upsert_worker(&mut self, name: &str) -> &mut ChildWorker {
        let i = match self.index.get(name) {
            Some(&i) => i,
            None => {
                info!(worker = %name, "new worker registered");
                self.workers.push(ChildWorker::new(name));
                let i = self.workers.len() - 1;
                self.index.insert(name.to_string(), i);
                i
            }
        };
        &mut self.workers[i]
    }

    /// Pick the least-loaded `up` worker; ties go to the first seen.
    pub fn select_worker(&self) -> Option<&ChildWorker> {
        self.workers
            .iter()
            .filter(|w| w.up)
            .min_by(|a, b| a.cpu_usage.total_cmp(&b.cpu_usage))
    }

    /// Queue `request` for `worker` and remember it as pending.
    pub fn enqueue_start(
        &mut self,
        worker: &str,
        request: StartRequest,
    ) -> Option<oneshot::Receiver<PlacementOutcome>> {
        let (tx, rx) = oneshot::channel();
        let instance = request.instance.clone();
        let target = self.worker_mut(worker)?;
        target.mailbox.enqueue(MailboxMessage::Start(request.clone()));
        self.pending.insert(
            instance,
            PendingStart {
                request,
                worker: worker.to_string(),
                tx,
            },
        );
        Some(rx)
    }

    /// Move a pending start to the abandoned table and tell its waiter the
    /// worker was lost. Returns false if it was no longer pending.
    pub fn abandon(&mut self, instance: &str) -> bool {
        let Some(pending) = self.pending.remove(instance) else {
            return false;
        };
        debug!(%instance, worker = %pending.worker, "pending start abandoned");
        self.abandoned.insert(
            instance.to_string(),
            AbandonedStart {
                request: pending.request,
                worker: pending.worker,
                abandoned_at: Instant::now(),
            },
        );
        let _ = pending.tx.send(PlacementOutcome::WorkerLost);
        true
    }

    /// Forget a pending start whose waiter went away, including any copy
    /// still sitting in the worker's mailbox.
    pub fn forget_pending(&mut self, instance: &str) {
        if let Some(pending) = self.pending.remove(instance) {
            if let Some(worker) = self.worker_mut(&pending.worker) {
                worker.mailbox.cancel_start(instance);
            }
            debug!(%instance, "pending start dropped");
        }
    }

    /// Mark `worker` down if it has not heartbeated since `seq`.
    ///
    /// Abandons every start assigned to that worker and not yet confirmed,
    /// whether it was delivered by an earlier heartbeat or is still waiting
    /// in the mailbox. Returns the abandoned instance ids, or `None` if the
    /// worker checked in again.
    pub fn expire_worker(&mut self, worker: &str, seq: u64) -> Option<Vec<String>> {
        let target = self.worker_mut(worker)?;
        if target.heartbeat_seq != seq {
            return None;
        }
        target.up = false;
        target.mailbox.take_starts();

        let mut lost: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.worker == worker)
            .map(|(instance, _)| instance.clone())
            .collect();
        lost.sort();
        lost.retain(|instance| self.abandon(instance));
        Some(lost)
    }

    /// Queue a stop for `instance` on `worker`.
    ///
    /// A worker the registry has not heard from since it started gets a
    /// down entry whose mailbox holds the stop until its next heartbeat.
    pub fn enqueue_stop(&mut self, worker: &str, instance: &str) {
        if self.worker(worker).is_none() {
            debug!(%worker, %instance, "holding stop for worker not yet seen");
        }
        self.upsert_worker(worker)
            .mailbox
            .enqueue(MailboxMessage::Stop(StopRequest {
                instance: instance.to_string(),
            }));
    }

    /// Drop abandoned entries older than `cutoff`.
    pub fn gc_abandoned(&mut self, cutoff: Instant) -> usize {
        let before = self.abandoned.len();
        self.abandoned.retain(|_, a| a.abandoned_at >= cutoff);
        before - self.abandoned.len()
    }
}
