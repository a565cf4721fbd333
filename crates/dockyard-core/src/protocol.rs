//! Wire protocol between the registry, workers and clients.
//!
//! Bodies are JSON. Identifying fields that accompany raw streams (push,
//! pull) travel as `cluster-*` headers instead.

use serde::{Deserialize, Serialize};

/// Registry HTTP routes.
pub mod routes {
    pub const CREATE_WORKER: &str = "/api/registry/create-worker";
    pub const CREATE_CLIENT: &str = "/api/registry/create-client";
    pub const PUSH: &str = "/api/registry/push";
    pub const UPGRADE: &str = "/api/registry/upgrade";
    pub const PING: &str = "/api/registry/ping";
    pub const PULL: &str = "/api/registry/pull";
    pub const STARTED_APPLICATION: &str = "/api/registry/started-application";
}

/// Request header names.
pub mod headers {
    pub const AUTH_USERNAME: &str = "cluster-auth-username";
    pub const AUTH_KEY: &str = "cluster-auth-key";
    pub const APPLICATION: &str = "cluster-application";
    pub const VERSION: &str = "cluster-version";
    pub const IMAGE_NAME: &str = "cluster-image-name";
    pub const ENV: &str = "cluster-env";
    pub const KEY: &str = "cluster-key";
    pub const WORKER: &str = "cluster-worker";
    pub const INSTANCE: &str = "cluster-instance";
    pub const PORT: &str = "cluster-port";
}

/// Environment variables injected into every started container.
pub mod env_vars {
    pub const PORT: &str = "PORT";
    pub const APPLICATION: &str = "CLUSTER_APPLICATION";
    pub const INTERNAL_PORT: &str = "CLUSTER_INTERNAL_PORT";
    pub const EXTERNAL_PORT: &str = "CLUSTER_EXTERNAL_PORT";
    pub const VERSION: &str = "CLUSTER_VERSION";
    pub const INSTANCE: &str = "CLUSTER_INSTANCE";
    pub const CLUSTER_NAME: &str = "CLUSTER_NAME";
    pub const WORKER: &str = "CLUSTER_WORKER";
    pub const REGISTRY: &str = "CLUSTER_REGISTRY";
    pub const ENV: &str = "CLUSTER_ENV";
}

/// Default registry listen port.
pub const DEFAULT_PORT: u16 = 7420;

// ── Mailbox messages ───────────────────────────────────────────────

/// Ask a worker to run one instance of `application:version` in `env`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub application: String,
    pub version: String,
    pub env: String,
    pub instance: String,
    pub image_id: String,
}

/// Ask a worker to terminate an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopRequest {
    pub instance: String,
}

/// A message waiting in a worker's mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MailboxMessage {
    Start(StartRequest),
    Stop(StopRequest),
}

// ── Heartbeat ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub name: String,
    pub key: String,
    /// Host load, 0–100.
    pub cpu_usage: f64,
    /// Publicly reachable hostname of the worker, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Drained mailbox contents, split by message kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PingResponse {
    pub start: Vec<StartRequest>,
    pub stop: Vec<StopRequest>,
}

impl PingResponse {
    /// Split drained messages by kind, preserving mailbox order within each kind.
    pub fn from_messages(messages: impl IntoIterator<Item = MailboxMessage>) -> Self {
        let mut response = Self::default();
        for message in messages {
            match message {
                MailboxMessage::Start(req) => response.start.push(req),
                MailboxMessage::Stop(req) => response.stop.push(req),
            }
        }
        response
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty()
    }
}

// ── Enrollment ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkerRequest {
    /// Registry master key.
    pub key: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientRequest {
    /// Registry master key.
    pub key: String,
    pub username: String,
}

/// Assigned key plus the registry (cluster) name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsResponse {
    pub key: String,
    pub name: String,
}

/// `{}` — the body of every acknowledgement response.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {}
