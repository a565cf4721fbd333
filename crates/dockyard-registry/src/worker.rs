//! In-memory view of a child worker and its mailbox.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use dockyard_core::{MailboxMessage, StartRequest};

/// FIFO of messages waiting for a worker's next heartbeat.
#[derive(Debug, Default)]
pub struct Mailbox {
    messages: VecDeque<MailboxMessage>,
}

impl Mailbox {
    pub fn enqueue(&mut self, message: MailboxMessage) {
        self.messages.push_back(message);
    }

    /// Take every queued message, oldest first, leaving the mailbox empty.
    pub fn drain_all(&mut self) -> Vec<MailboxMessage> {
        self.messages.drain(..).collect()
    }

    /// Remove undelivered start requests, returning them.
    pub fn take_starts(&mut self) -> Vec<StartRequest> {
        let mut starts = Vec::new();
        self.messages.retain(|message| match message {
            MailboxMessage::Start(req) => {
                starts.push(req.clone());
                false
            }
            MailboxMessage::Stop(_) => true,
        });
        starts
    }

    /// Drop an undelivered start request for `instance`, if queued.
    pub fn cancel_start(&mut self, instance: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(
            |message| !matches!(message, MailboxMessage::Start(req) if req.instance == instance),
        );
        self.messages.len() != before
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A worker known to the registry.
///
/// Created on the first authenticated heartbeat, never removed.
#[derive(Debug)]
pub struct ChildWorker {
    pub name: String,
    pub last_seen_at: DateTime<Utc>,
    /// Bumped on every heartbeat; the timeout check compares against it.
    pub heartbeat_seq: u64,
    /// Host load, 0–100.
    pub cpu_usage: f64,
    pub up: bool,
    /// Public hostname announced in heartbeats.
    pub endpoint: Option<String>,
    pub mailbox: Mailbox,
}

impl ChildWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_seen_at: Utc::now(),
            heartbeat_seq: 0,
            cpu_usage: 0.0,
            up: false,
            endpoint: None,
            mailbox: Mailbox::default(),
        }
    }

    /// Record a heartbeat and return its sequence number.
    pub fn touch(&mut self, cpu_usage: f64) -> u64 {
        self.cpu_usage = cpu_usage.clamp(0.0, 100.0);
        self.last_seen_at = Utc::now();
        self.heartbeat_seq += 1;
        self.up = true;
        self.heartbeat_seq
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            name: self.name.clone(),
            up: self.up,
            cpu_usage: self.cpu_usage,
            mailbox_depth: self.mailbox.len(),
            last_seen_at: self.last_seen_at,
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Snapshot of one worker for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub up: bool,
    pub cpu_usage: f64,
    pub mailbox_depth: usize,
    pub last_seen_at: DateTime<Utc>,
    pub endpoint: Option<String>,
}
