//! Worker → registry calls.
//!
//! [`RegistryLink`] is the seam the agent is tested through;
//! [`HttpRegistryLink`] speaks the registry's HTTP API with a pooled
//! hyper client. Non-2xx answers become [`WorkerError::Registry`] with the
//! message from the registry's `{"success": false, "error": ...}` body.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use dockyard_core::{
    Ack, CreateWorkerRequest, CredentialsResponse, PingRequest, PingResponse, headers, routes,
};

use crate::engine::ArtifactStream;
use crate::error::{WorkerError, WorkerResult};

#[async_trait]
pub trait RegistryLink: Send + Sync + 'static {
    /// Enroll under `name` with the registry master key.
    async fn create_worker(&self, master_key: &str, name: &str)
    -> WorkerResult<CredentialsResponse>;

    async fn ping(&self, request: &PingRequest) -> WorkerResult<PingResponse>;

    /// Stream the image artifact of `application:version`.
    async fn pull(
        &self,
        worker: &str,
        key: &str,
        application: &str,
        version: &str,
    ) -> WorkerResult<ArtifactStream>;

    async fn report_started(
        &self,
        worker: &str,
        key: &str,
        instance: &str,
        port: u16,
    ) -> WorkerResult<()>;
}

/// [`RegistryLink`] over HTTP/1.
#[derive(Clone)]
pub struct HttpRegistryLink {
    base: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpRegistryLink {
    /// `host` is `host:port` or a full `http://` URL.
    pub fn new(host: &str) -> Self {
        Self {
            base: base_url(host),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn request(
        &self,
        route: &str,
        fields: &[(&str, &str)],
        body: Bytes,
    ) -> WorkerResult<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("{}{route}", self.base))
            .header(header::USER_AGENT, "dockyard-worker/0.1");
        for (name, value) in fields {
            builder = builder.header(*name, *value);
        }
        if !body.is_empty() {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
        }
        builder
            .body(Full::new(body))
            .map_err(|e| WorkerError::Http(e.to_string()))
    }

    /// Send and fail on anything but 2xx.
    async fn send(&self, request: Request<Full<Bytes>>) -> WorkerResult<Response<Incoming>> {
        let uri = request.uri().clone();
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| WorkerError::Http(format!("{uri}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        debug!(%uri, %status, "registry rejected request");
        Err(WorkerError::Registry {
            status: status.as_u16(),
            message: error_message(status, &body),
        })
    }

    async fn post_json<T, R>(&self, route: &str, value: &T) -> WorkerResult<R>
    where
        T: Serialize + Sync,
        R: DeserializeOwned,
    {
        let body = Bytes::from(serde_json::to_vec(value)?);
        let response = self.send(self.request(route, &[], body)?).await?;
        read_json(response).await
    }
}

async fn read_json<R: DeserializeOwned>(response: Response<Incoming>) -> WorkerResult<R> {
    let bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|e| WorkerError::Http(e.to_string()))?
        .to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl RegistryLink for HttpRegistryLink {
    async fn create_worker(
        &self,
        master_key: &str,
        name: &str,
    ) -> WorkerResult<CredentialsResponse> {
        let request = CreateWorkerRequest {
            key: master_key.to_string(),
            name: name.to_string(),
        };
        self.post_json(routes::CREATE_WORKER, &request).await
    }

    async fn ping(&self, request: &PingRequest) -> WorkerResult<PingResponse> {
        self.post_json(routes::PING, request).await
    }

    async fn pull(
        &self,
        worker: &str,
        key: &str,
        application: &str,
        version: &str,
    ) -> WorkerResult<ArtifactStream> {
        let request = self.request(
            routes::PULL,
            &[
                (headers::WORKER, worker),
                (headers::KEY, key),
                (headers::APPLICATION, application),
                (headers::VERSION, version),
            ],
            Bytes::new(),
        )?;
        let response = self.send(request).await?;
        Ok(response
            .into_body()
            .into_data_stream()
            .map_err(io::Error::other)
            .boxed())
    }

    async fn report_started(
        &self,
        worker: &str,
        key: &str,
        instance: &str,
        port: u16,
    ) -> WorkerResult<()> {
        let port = port.to_string();
        let request = self.request(
            routes::STARTED_APPLICATION,
            &[
                (headers::WORKER, worker),
                (headers::KEY, key),
                (headers::INSTANCE, instance),
                (headers::PORT, &port),
            ],
            Bytes::new(),
        )?;
        let response = self.send(request).await?;
        let Ack {} = read_json(response).await?;
        Ok(())
    }
}

fn base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// The `error` field of a registry error body, or the status reason.
fn error_message(status: StatusCode, body: &[u8]) -> String {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: String,
    }

    serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.error)
        .unwrap_or_else(|_| {
            status
                .canonical_reason()
                .unwrap_or("unexpected status")
                .to_string()
        })
}
