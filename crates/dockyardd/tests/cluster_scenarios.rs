//! Cluster scenario tests.
//!
//! Runs a registry behind a real HTTP listener and drives it the way
//! clients and worker agents do: clients through the router, workers
//! through `HttpRegistryLink`. The container engine is faked.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use dockyard_api::build_router;
use dockyard_core::{ClusterConfig, Crypto, OsCrypto, PingRequest, headers, routes};
use dockyard_registry::{Registry, RegistryError};
use dockyard_state::paths::registry as paths;
use dockyard_state::{ActivePlacement, ArtifactStore, StateStore};
use dockyard_worker::{
    ArtifactStream, ContainerEngine, ContainerState, EngineResult, HttpRegistryLink,
    RegistryLink, RunSpec, StartOutcome, WorkerAgent, WorkerError, WorkerStore, enroll,
};

// ── Harness ────────────────────────────────────────────────────────

struct Cluster {
    registry: Registry,
    router: Router,
    master_key: String,
    addr: SocketAddr,
    _dir: tempfile::TempDir,
}

fn test_config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.cluster.ping_interval_ms = 50;
    config.cluster.ping_timeout_ms = 5_000;
    config
}

async fn cluster() -> Cluster {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open_in_memory().unwrap();
    let master_key = Registry::install(&store, &OsCrypto, "e2e").unwrap();
    let artifacts = ArtifactStore::open(dir.path().join("artifacts")).unwrap();
    let registry = Registry::open(store, artifacts, Arc::new(OsCrypto), test_config()).unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = build_router(registry.clone());
    tokio::spawn(async move { axum::serve(listener, served).await });

    Cluster {
        router: build_router(registry.clone()),
        registry,
        master_key,
        addr,
        _dir: dir,
    }
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn enroll_client(c: &Cluster) -> String {
    let req = Request::builder()
        .method("POST")
        .uri(routes::CREATE_CLIENT)
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"key": c.master_key, "username": "alice"}).to_string(),
        ))
        .unwrap();
    let resp = c.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    body_json(resp).await["key"].as_str().unwrap().to_string()
}

async fn push(c: &Cluster, key: &str, version: &str, artifact: &'static str) -> StatusCode {
    let req = Request::builder()
        .method("POST")
        .uri(routes::PUSH)
        .header(headers::AUTH_USERNAME, "alice")
        .header(headers::AUTH_KEY, key)
        .header(headers::APPLICATION, "myapp")
        .header(headers::VERSION, version)
        .header(headers::IMAGE_NAME, "sha256:feed")
        .body(Body::from(artifact))
        .unwrap();
    c.router.clone().oneshot(req).await.unwrap().status()
}

fn upgrade_request(key: &str, version: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(routes::UPGRADE)
        .header(headers::AUTH_USERNAME, "alice")
        .header(headers::AUTH_KEY, key)
        .header(headers::ENV, "prod")
        .header(headers::APPLICATION, "myapp")
        .header(headers::VERSION, version)
        .body(Body::empty())
        .unwrap()
}

// ── Fake engine ────────────────────────────────────────────────────

#[derive(Default)]
struct EngineState {
    images: HashSet<String>,
    containers: HashMap<String, ContainerState>,
    runs: Vec<RunSpec>,
}

#[derive(Clone, Default)]
struct FakeEngine(Arc<Mutex<EngineState>>);

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn has_image(&self, image: &str) -> EngineResult<bool> {
        Ok(self.0.lock().unwrap().images.contains(image))
    }

    async fn load_image(&self, mut artifact: ArtifactStream) -> EngineResult<()> {
        let mut bytes = Vec::new();
        while let Some(chunk) = artifact.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        // Pushed artifacts in these tests carry their image name as the body.
        let image = String::from_utf8_lossy(&bytes).into_owned();
        self.0.lock().unwrap().images.insert(image);
        Ok(())
    }

    async fn container_state(&self, name: &str) -> EngineResult<ContainerState> {
        Ok(self
            .0
            .lock()
            .unwrap()
            .containers
            .get(name)
            .copied()
            .unwrap_or(ContainerState::Missing))
    }

    async fn run(&self, spec: &RunSpec) -> EngineResult<()> {
        let mut state = self.0.lock().unwrap();
        state.runs.push(spec.clone());
        state
            .containers
            .insert(spec.name.clone(), ContainerState::Running);
        Ok(())
    }

    async fn remove(&self, name: &str, _force: bool) -> EngineResult<()> {
        self.0.lock().unwrap().containers.remove(name);
        Ok(())
    }
}

/// Ports from a counter, so the external port is predictable.
struct SeqPorts(AtomicU16);

impl Crypto for SeqPorts {
    fn create_key(&self) -> String {
        OsCrypto.create_key()
    }

    fn create_id(&self) -> String {
        OsCrypto.create_id()
    }

    fn free_port(&self) -> io::Result<u16> {
        Ok(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

struct Worker {
    agent: WorkerAgent<FakeEngine, HttpRegistryLink>,
    engine: FakeEngine,
    cpu: watch::Sender<f64>,
}

async fn join_worker(c: &Cluster, name: &str, first_port: u16) -> Worker {
    let host = c.addr.to_string();
    let link = HttpRegistryLink::new(&host);
    let identity = enroll(&link, &c.master_key, name, &host, None)
        .await
        .unwrap();
    assert_eq!(identity.cluster, "e2e");

    let store = WorkerStore::new(StateStore::open_in_memory().unwrap());
    store.save_identity(&identity).unwrap();

    let engine = FakeEngine::default();
    let (cpu, cpu_rx) = watch::channel(0.0);
    let agent = WorkerAgent::new(
        engine.clone(),
        link,
        store,
        Arc::new(SeqPorts(AtomicU16::new(first_port))),
        test_config(),
        cpu_rx,
        CancellationToken::new(),
    )
    .unwrap();
    Worker { agent, engine, cpu }
}

/// Heartbeat until the mailbox delivers something, then finish the work.
async fn ping_until_delivered(worker: &Worker) -> usize {
    for _ in 0..200 {
        let handles = worker.agent.ping_once().await.unwrap();
        if !handles.is_empty() {
            let delivered = handles.len();
            for handle in handles {
                handle.await.unwrap();
            }
            return delivered;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("nothing delivered to {}", worker.agent.identity().name);
}

// ── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn push_upgrade_heartbeat_report_sets_latest() {
    let c = cluster().await;
    let key = enroll_client(&c).await;
    assert_eq!(push(&c, &key, "1", "myapp:1").await, StatusCode::OK);

    // w1 announces itself with cpu 0.
    let w1 = join_worker(&c, "w1", 8079).await;
    assert!(w1.agent.ping_once().await.unwrap().is_empty());

    let router = c.router.clone();
    let upgrade_key = key.clone();
    let upgrade =
        tokio::spawn(async move { router.oneshot(upgrade_request(&upgrade_key, "1")).await });

    // One StartRequest arrives; the agent pulls, runs, and reports 8080.
    assert_eq!(ping_until_delivered(&w1).await, 1);

    let resp = upgrade.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_json(resp).await, json!({}));
    assert_eq!(
        c.registry.latest("myapp", "prod").unwrap().as_deref(),
        Some("1")
    );

    let runs = w1.engine.0.lock().unwrap().runs.clone();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].image, "myapp:1");
    assert_eq!(runs[0].external_port, 8080);

    let instances = c
        .registry
        .store()
        .list(&paths::active_worker("myapp", "prod", "1", "w1"))
        .unwrap();
    assert_eq!(instances, vec![runs[0].name.clone()]);
    let placement: ActivePlacement = c
        .registry
        .store()
        .get_json(&paths::active_instance("myapp", "prod", "1", "w1", &instances[0]))
        .unwrap()
        .unwrap();
    assert_eq!(placement.port, 8080);
    assert!(
        !c.registry
            .store()
            .exists(&paths::dangling("myapp", "prod"))
            .unwrap()
    );

    // Redelivering the same start is a no-op on the worker.
    let again = dockyard_core::StartRequest {
        application: "myapp".to_string(),
        version: "1".to_string(),
        env: "prod".to_string(),
        instance: runs[0].name.clone(),
        image_id: "sha256:feed".to_string(),
    };
    assert_eq!(
        w1.agent.start(&again).await.unwrap(),
        StartOutcome::AlreadyRunning
    );
    assert_eq!(w1.engine.0.lock().unwrap().runs.len(), 1);
}

#[tokio::test]
async fn placement_prefers_least_loaded_worker() {
    let c = cluster().await;
    let key = enroll_client(&c).await;
    assert_eq!(push(&c, &key, "1", "myapp:1").await, StatusCode::OK);

    let w1 = join_worker(&c, "w1", 20_000).await;
    let w2 = join_worker(&c, "w2", 21_000).await;
    w1.cpu.send(5.0).unwrap();
    w2.cpu.send(2.0).unwrap();
    w1.agent.ping_once().await.unwrap();
    w2.agent.ping_once().await.unwrap();

    let registry = c.registry.clone();
    let cancel = CancellationToken::new();
    let upgrade = tokio::spawn(async move {
        registry
            .upgrade("alice", &key, "myapp", "1", "prod", &cancel)
            .await
    });

    assert_eq!(ping_until_delivered(&w2).await, 1);
    let placement = upgrade.await.unwrap().unwrap();
    assert_eq!(placement.worker, "w2");
    assert_eq!(placement.port, 21_001);

    // w1 never saw the start.
    assert!(w1.agent.ping_once().await.unwrap().is_empty());
    assert!(w1.engine.0.lock().unwrap().runs.is_empty());
}

#[tokio::test]
async fn second_upgrade_drains_previous_version() {
    let c = cluster().await;
    let key = enroll_client(&c).await;
    assert_eq!(push(&c, &key, "1", "myapp:1").await, StatusCode::OK);
    assert_eq!(push(&c, &key, "2", "myapp:2").await, StatusCode::OK);

    let w1 = join_worker(&c, "w1", 30_000).await;
    w1.agent.ping_once().await.unwrap();

    for version in ["1", "2"] {
        let router = c.router.clone();
        let key = key.clone();
        let upgrade =
            tokio::spawn(async move { router.oneshot(upgrade_request(&key, version)).await });
        ping_until_delivered(&w1).await;
        assert_eq!(upgrade.await.unwrap().unwrap().status(), StatusCode::OK);
    }
    assert_eq!(
        c.registry.latest("myapp", "prod").unwrap().as_deref(),
        Some("2")
    );

    // The stop for the version-1 instance rides the next heartbeat.
    assert_eq!(ping_until_delivered(&w1).await, 1);
    let engine = w1.engine.0.lock().unwrap();
    let running: Vec<_> = engine
        .containers
        .iter()
        .filter(|(_, state)| **state == ContainerState::Running)
        .map(|(name, _)| name.clone())
        .collect();
    assert_eq!(running.len(), 1);
    let v2 = engine.runs.iter().find(|r| r.image == "myapp:2").unwrap();
    assert_eq!(running[0], v2.name);
}

#[tokio::test]
async fn conflicts_surface_over_http() {
    let c = cluster().await;
    let key = enroll_client(&c).await;
    assert_eq!(push(&c, &key, "1", "myapp:1").await, StatusCode::OK);
    assert_eq!(push(&c, &key, "1", "other").await, StatusCode::CONFLICT);

    // The worker link reports registry rejections with their status.
    let link = HttpRegistryLink::new(&c.addr.to_string());
    let err = link
        .create_worker("wrong-master-key", "w1")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Registry { status: 401, .. }));

    join_worker(&c, "w1", 40_000).await;
    let err = link
        .create_worker(&c.master_key, "w1")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Registry { status: 409, .. }));

    let err = link
        .ping(&PingRequest {
            name: "w1".to_string(),
            key: "forged".to_string(),
            cpu_usage: 0.0,
            endpoint: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Registry { status: 401, .. }));
}

#[tokio::test]
async fn pull_streams_the_pushed_artifact() {
    let c = cluster().await;
    let key = enroll_client(&c).await;
    assert_eq!(push(&c, &key, "1", "image-bytes").await, StatusCode::OK);

    let w1 = join_worker(&c, "w1", 50_000).await;
    let identity = w1.agent.identity().clone();
    let link = HttpRegistryLink::new(&c.addr.to_string());

    let mut stream = link
        .pull(&identity.name, &identity.key, "myapp", "1")
        .await
        .unwrap();
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(Bytes::from(bytes), Bytes::from_static(b"image-bytes"));

    let err = link
        .pull(&identity.name, &identity.key, "myapp", "9")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, WorkerError::Registry { status: 404, .. }));
}

#[tokio::test]
async fn upgrade_of_unknown_version_fails_fast() {
    let c = cluster().await;
    let key = c
        .registry
        .create_client(&c.master_key, "bob")
        .unwrap()
        .key;
    let err = c
        .registry
        .upgrade("bob", &key, "myapp", "1", "prod", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound(_)));
}
