//! dockyard-api — HTTP API of the Dockyard registry.
//!
//! # API Routes
//!
//! | Method | Path | Caller | Description |
//! |---|---|---|---|
//! | POST | `/api/registry/create-worker` | operator | Enroll a worker (master key) |
//! | POST | `/api/registry/create-client` | operator | Enroll a client (master key) |
//! | POST | `/api/registry/push` | client | Upload a version's image artifact |
//! | POST | `/api/registry/upgrade` | client | Move an env to a version |
//! | POST | `/api/registry/ping` | worker | Heartbeat, returns mailbox contents |
//! | POST | `/api/registry/pull` | worker | Download a version's image artifact |
//! | POST | `/api/registry/started-application` | worker | Confirm an instance is running |

pub mod handlers;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::post;

use dockyard_core::routes;
use dockyard_registry::Registry;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Registry,
}

/// Build the registry router.
pub fn build_router(registry: Registry) -> Router {
    let state = ApiState { registry };

    Router::new()
        .route(routes::CREATE_WORKER, post(handlers::create_worker))
        .route(routes::CREATE_CLIENT, post(handlers::create_client))
        .route(
            routes::PUSH,
            post(handlers::push).layer(DefaultBodyLimit::disable()),
        )
        .route(routes::UPGRADE, post(handlers::upgrade))
        .route(routes::PING, post(handlers::ping))
        .route(routes::PULL, post(handlers::pull))
        .route(routes::STARTED_APPLICATION, post(handlers::started_application))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use dockyard_core::{ClusterConfig, OsCrypto, headers};
    use dockyard_state::{ArtifactStore, StateStore};

    use super::*;

    struct Harness {
        router: Router,
        master_key: String,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open_in_memory().unwrap();
        let master_key = Registry::install(&store, &OsCrypto, "api-test").unwrap();
        let artifacts = ArtifactStore::open(dir.path()).unwrap();
        let registry =
            Registry::open(store, artifacts, Arc::new(OsCrypto), ClusterConfig::default()).unwrap();
        Harness {
            router: build_router(registry),
            master_key,
            _dir: dir,
        }
    }

    fn json_request(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn enroll_client(h: &Harness) -> String {
        let req = json_request(
            routes::CREATE_CLIENT,
            json!({"key": h.master_key, "username": "alice"}),
        );
        let resp = h.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        body_json(resp).await["key"].as_str().unwrap().to_string()
    }

    fn push_request(key: &str, version: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(routes::PUSH)
            .header(headers::AUTH_USERNAME, "alice")
            .header(headers::AUTH_KEY, key)
            .header(headers::APPLICATION, "myapp")
            .header(headers::VERSION, version)
            .header(headers::IMAGE_NAME, "sha256:feed")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn create_worker_returns_key_and_cluster_name() {
        let h = harness();
        let req = json_request(routes::CREATE_WORKER, json!({"key": h.master_key, "name": "w1"}));
        let resp = h.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["name"], "api-test");
        assert!(body["key"].as_str().unwrap().len() >= 32);

        let req = json_request(routes::CREATE_WORKER, json!({"key": h.master_key, "name": "w1"}));
        let resp = h.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn wrong_master_key_is_unauthorized() {
        let h = harness();
        let req = json_request(routes::CREATE_WORKER, json!({"key": "nope", "name": "w1"}));
        let resp = h.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("unauthorized"));
    }

    #[tokio::test]
    async fn push_conflict_and_pull_round_trip() {
        let h = harness();
        let key = enroll_client(&h).await;

        let resp = h.router.clone().oneshot(push_request(&key, "1", "layers")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, json!({}));

        let resp = h.router.clone().oneshot(push_request(&key, "1", "other")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let req = json_request(routes::CREATE_WORKER, json!({"key": h.master_key, "name": "w1"}));
        let resp = h.router.clone().oneshot(req).await.unwrap();
        let wkey = body_json(resp).await["key"].as_str().unwrap().to_string();

        let req = Request::builder()
            .method("POST")
            .uri(routes::PULL)
            .header(headers::WORKER, "w1")
            .header(headers::KEY, &wkey)
            .header(headers::APPLICATION, "myapp")
            .header(headers::VERSION, "1")
            .body(Body::empty())
            .unwrap();
        let resp = h.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"layers");
    }

    #[tokio::test]
    async fn push_without_headers_is_bad_request() {
        let h = harness();
        let req = Request::builder()
            .method("POST")
            .uri(routes::PUSH)
            .body(Body::from("x"))
            .unwrap();
        let resp = h.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ping_with_bad_key_is_unauthorized() {
        let h = harness();
        let req = json_request(routes::PING, json!({"name": "w1", "key": "k", "cpuUsage": 0.0}));
        let resp = h.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn upgrade_of_missing_version_is_not_found() {
        let h = harness();
        let key = enroll_client(&h).await;
        let req = Request::builder()
            .method("POST")
            .uri(routes::UPGRADE)
            .header(headers::AUTH_USERNAME, "alice")
            .header(headers::AUTH_KEY, &key)
            .header(headers::ENV, "prod")
            .header(headers::APPLICATION, "myapp")
            .header(headers::VERSION, "9")
            .body(Body::empty())
            .unwrap();
        let resp = h.router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn started_application_validates_port_and_instance() {
        let h = harness();
        let req = json_request(routes::CREATE_WORKER, json!({"key": h.master_key, "name": "w1"}));
        let resp = h.router.clone().oneshot(req).await.unwrap();
        let wkey = body_json(resp).await["key"].as_str().unwrap().to_string();

        let report = |port: &str| {
            Request::builder()
                .method("POST")
                .uri(routes::STARTED_APPLICATION)
                .header(headers::WORKER, "w1")
                .header(headers::KEY, &wkey)
                .header(headers::INSTANCE, "abc123")
                .header(headers::PORT, port)
                .body(Body::empty())
                .unwrap()
        };

        let resp = h.router.clone().oneshot(report("not-a-port")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = h.router.oneshot(report("8080")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
