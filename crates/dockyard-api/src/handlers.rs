//! Registry API handlers.
//!
//! Each handler authenticates through the [`Registry`] and returns the
//! plain JSON body the peer expects. Failures share one shape,
//! `{"success": false, "error": "..."}`, with the status derived from the
//! [`RegistryError`] kind.

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use dockyard_core::{Ack, CreateClientRequest, CreateWorkerRequest, PingRequest, headers};
use dockyard_registry::RegistryError;

use crate::ApiState;

/// Error body shared by every endpoint.
#[derive(serde::Serialize)]
struct ApiResponse {
    success: bool,
    error: String,
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse {
            success: false,
            error: msg.to_string(),
        }),
    )
        .into_response()
}

/// HTTP status for a registry failure.
pub fn status_for(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        RegistryError::VersionExists { .. }
        | RegistryError::WorkerExists(_)
        | RegistryError::ClientExists(_)
        | RegistryError::UpgradeInProgress { .. } => StatusCode::CONFLICT,
        RegistryError::NotFound(_) | RegistryError::UnknownInstance(_) => StatusCode::NOT_FOUND,
        RegistryError::BadRequest(_) | RegistryError::InvalidName(_) => StatusCode::BAD_REQUEST,
        RegistryError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        RegistryError::NotInstalled
        | RegistryError::AlreadyInstalled
        | RegistryError::PlacementExhausted(_)
        | RegistryError::Artifact(_)
        | RegistryError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn registry_error(err: RegistryError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        warn!(error = %err, %status, "request rejected");
    }
    error_response(&err.to_string(), status)
}

/// Read a required header as text.
fn required_header<'a>(map: &'a HeaderMap, name: &str) -> Result<&'a str, Response> {
    map.get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| error_response(&format!("missing header {name}"), StatusCode::BAD_REQUEST))
}

macro_rules! try_header {
    ($map:expr, $name:expr) => {
        match required_header($map, $name) {
            Ok(value) => value,
            Err(resp) => return resp,
        }
    };
}

// ── Enrollment ─────────────────────────────────────────────────

/// POST /api/registry/create-worker
pub async fn create_worker(
    State(state): State<ApiState>,
    Json(req): Json<CreateWorkerRequest>,
) -> Response {
    match state.registry.create_worker(&req.key, &req.name) {
        Ok(creds) => Json(creds).into_response(),
        Err(e) => registry_error(e),
    }
}

/// POST /api/registry/create-client
pub async fn create_client(
    State(state): State<ApiState>,
    Json(req): Json<CreateClientRequest>,
) -> Response {
    match state.registry.create_client(&req.key, &req.username) {
        Ok(creds) => Json(creds).into_response(),
        Err(e) => registry_error(e),
    }
}

// ── Deployment ─────────────────────────────────────────────────

/// POST /api/registry/push
///
/// The raw request body is the image artifact.
pub async fn push(State(state): State<ApiState>, map: HeaderMap, body: Body) -> Response {
    let username = try_header!(&map, headers::AUTH_USERNAME);
    let key = try_header!(&map, headers::AUTH_KEY);
    let application = try_header!(&map, headers::APPLICATION);
    let version = try_header!(&map, headers::VERSION);
    let image = try_header!(&map, headers::IMAGE_NAME);

    match state
        .registry
        .push(username, key, application, version, image, body.into_data_stream())
        .await
    {
        Ok(_) => Json(Ack {}).into_response(),
        Err(e) => registry_error(e),
    }
}

/// POST /api/registry/upgrade
///
/// Responds once an instance of the new version is running. The upgrade
/// runs in its own task and survives a dropped connection; only registry
/// shutdown cancels it.
pub async fn upgrade(State(state): State<ApiState>, map: HeaderMap) -> Response {
    let username = try_header!(&map, headers::AUTH_USERNAME).to_string();
    let key = try_header!(&map, headers::AUTH_KEY).to_string();
    let env = try_header!(&map, headers::ENV).to_string();
    let application = try_header!(&map, headers::APPLICATION).to_string();
    let version = try_header!(&map, headers::VERSION).to_string();

    let registry = state.registry.clone();
    let cancel = registry.shutdown_token().child_token();
    let task = tokio::spawn(async move {
        registry
            .upgrade(&username, &key, &application, &version, &env, &cancel)
            .await
    });

    match task.await {
        Ok(Ok(_)) => Json(Ack {}).into_response(),
        Ok(Err(e)) => registry_error(e),
        Err(e) => {
            error!(error = %e, "upgrade task failed");
            error_response("upgrade task failed", StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ── Workers ────────────────────────────────────────────────────

/// POST /api/registry/ping
pub async fn ping(State(state): State<ApiState>, Json(req): Json<PingRequest>) -> Response {
    match state.registry.ping(&req).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => registry_error(e),
    }
}

/// POST /api/registry/pull
///
/// Streams the artifact back as `application/octet-stream`.
pub async fn pull(State(state): State<ApiState>, map: HeaderMap) -> Response {
    let worker = try_header!(&map, headers::WORKER);
    let key = try_header!(&map, headers::KEY);
    let application = try_header!(&map, headers::APPLICATION);
    let version = try_header!(&map, headers::VERSION);

    match state.registry.pull(worker, key, application, version).await {
        Ok((file, size)) => {
            let mut resp = Body::from_stream(ReaderStream::new(file)).into_response();
            let resp_headers = resp.headers_mut();
            resp_headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            resp_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            resp
        }
        Err(e) => registry_error(e),
    }
}

/// POST /api/registry/started-application
pub async fn started_application(State(state): State<ApiState>, map: HeaderMap) -> Response {
    let worker = try_header!(&map, headers::WORKER);
    let key = try_header!(&map, headers::KEY);
    let instance = try_header!(&map, headers::INSTANCE);
    let port = try_header!(&map, headers::PORT);

    let Ok(port) = port.trim().parse::<u16>() else {
        return error_response(&format!("invalid port {port:?}"), StatusCode::BAD_REQUEST);
    };
    let worker = match state.registry.verify_worker(worker, key) {
        Ok(name) => name,
        Err(e) => return registry_error(e),
    };

    match state.registry.report_started(&worker, instance, port).await {
        Ok(()) => Json(Ack {}).into_response(),
        Err(e) => registry_error(e),
    }
}
