//! Push, pull and the per-environment upgrade state machine.
//!
//! ```text
//!  NoEnv ──upgrade──▶ Upgrading ──placed──▶ Active
//!                        ▲  │                 │
//!                        │  └──failed──▶ (previous state)
//!                        └────upgrade─────────┘
//! ```
//!
//! The `dangling` file is both the rollback marker (it holds the previous
//! `latest`) and the upgrade lock: it is created with an exclusive
//! create-if-absent, and any upgrade that finds it present fails with
//! [`RegistryError::UpgradeInProgress`].

use std::fmt::Display;

use bytes::Bytes;
use futures_util::Stream;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dockyard_core::names;
use dockyard_state::paths::registry as paths;
use dockyard_state::{DanglingMarker, StateError, VersionRecord, epoch_secs};

use crate::error::{RegistryError, RegistryResult};
use crate::placement::Placement;
use crate::registry::Registry;

impl Registry {
    /// Store a new version's image artifact.
    ///
    /// The version directory is reserved before any bytes are written; a
    /// failed upload releases it again.
    pub async fn push<S, E>(
        &self,
        username: &str,
        key: &str,
        application: &str,
        version: &str,
        image_id: &str,
        body: S,
    ) -> RegistryResult<VersionRecord>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: Display,
    {
        let username = self.verify_client(username, key)?;
        let application = names::application(application)?;
        let version = names::version(version)?;
        let image_id = image_id.trim();
        if image_id.is_empty() {
            return Err(RegistryError::BadRequest("image name is empty".to_string()));
        }

        let store = &self.inner.store;
        store.create_dir(&paths::versions(&application))?;
        store.create_dir(&paths::envs(&application))?;

        let version_dir = paths::version(&application, &version);
        if !store.create_dir(&version_dir)? {
            return Err(RegistryError::VersionExists {
                application,
                version,
            });
        }

        let info = match self.inner.artifacts.write_stream(&application, &version, body).await {
            Ok(info) => info,
            Err(e) => {
                store.delete_tree(&version_dir)?;
                warn!(%application, %version, error = %e, "push failed, version released");
                return Err(match e {
                    StateError::Stream(msg) => RegistryError::Artifact(msg),
                    StateError::Io(io) => RegistryError::Artifact(io.to_string()),
                    other => other.into(),
                });
            }
        };

        let record = VersionRecord {
            application: application.clone(),
            version: version.clone(),
            image_id: image_id.to_string(),
            size: info.size,
            sha256: info.sha256,
            pushed_at: epoch_secs(),
        };
        store.put_json(&paths::version_record(&application, &version), &record)?;
        store.write_file(&paths::image_id(&application, &version), image_id.as_bytes())?;

        info!(
            %application,
            %version,
            client = %username,
            size = record.size,
            sha256 = %record.sha256,
            "version pushed"
        );
        Ok(record)
    }

    /// Open a version's artifact for a worker. Returns the file and its size.
    pub async fn pull(
        &self,
        worker: &str,
        key: &str,
        application: &str,
        version: &str,
    ) -> RegistryResult<(File, u64)> {
        let worker = self.verify_worker(worker, key)?;
        let application = names::application(application)?;
        let version = names::version(version)?;
        self.require_version(&application, &version)?;

        let (file, size) = self
            .inner
            .artifacts
            .open_reader(&application, &version)
            .await
            .map_err(|e| match e {
                StateError::NotFound(what) => RegistryError::NotFound(what),
                other => other.into(),
            })?;
        info!(%worker, %application, %version, size, "artifact pulled");
        Ok((file, size))
    }

    /// Image id of a pushed version.
    fn require_version(&self, application: &str, version: &str) -> RegistryResult<String> {
        self.inner
            .store
            .read_string(&paths::image_id(application, version))?
            .ok_or_else(|| RegistryError::NotFound(format!("version {application}:{version}")))
    }

    /// Current `latest` version of an env.
    pub fn latest(&self, application: &str, env: &str) -> RegistryResult<Option<String>> {
        let application = names::application(application)?;
        let env = names::env(env)?;
        Ok(self.inner.store.read_string(&paths::latest(&application, &env))?)
    }

    /// Move `env` of `application` to `version` and wait for one instance
    /// to be running.
    pub async fn upgrade(
        &self,
        username: &str,
        key: &str,
        application: &str,
        version: &str,
        env: &str,
        cancel: &CancellationToken,
    ) -> RegistryResult<Placement> {
        let username = self.verify_client(username, key)?;
        let application = names::application(application)?;
        let version = names::version(version)?;
        let env = names::env(env)?;
        self.require_version(&application, &version)?;

        let store = &self.inner.store;
        store.create_dir(&paths::active_versions(&application, &env))?;
        let previous = store.read_string(&paths::latest(&application, &env))?;

        let marker = DanglingMarker {
            previous: previous.clone(),
            target: version.clone(),
            started_at: epoch_secs(),
        };
        let dangling = paths::dangling(&application, &env);
        if !store.create_json(&dangling, &marker)? {
            warn!(%application, %env, %version, "upgrade rejected, another is in progress");
            return Err(RegistryError::UpgradeInProgress { application, env });
        }
        info!(
            %application,
            %env,
            %version,
            previous = previous.as_deref().unwrap_or("none"),
            client = %username,
            "upgrade started"
        );

        let active_dir = paths::active_version(&application, &env, &version);
        let created_dir = match store.create_dir(&active_dir) {
            Ok(created) => created,
            Err(e) => {
                store.delete_file(&dangling)?;
                return Err(e.into());
            }
        };

        let placement = match self.start(&application, &version, &env, cancel).await {
            Ok(placement) => placement,
            Err(e) => {
                if created_dir && store.list(&active_dir)?.is_empty() {
                    store.delete_tree(&active_dir)?;
                }
                store.delete_file(&dangling)?;
                warn!(%application, %env, %version, error = %e, "upgrade failed, lock released");
                return Err(e);
            }
        };

        let committed = store
            .write_file(&paths::latest(&application, &env), version.as_bytes())
            .map_err(RegistryError::from)
            .and_then(|()| self.record_placement(&application, &env, &version, &placement));
        if let Err(e) = committed {
            store.delete_file(&dangling)?;
            warn!(%application, %env, %version, error = %e, "upgrade not recorded, lock released");
            return Err(e);
        }

        let drain = previous
            .as_deref()
            .filter(|p| self.inner.config.registry.drain_previous && *p != version);
        if let Some(previous) = drain {
            if let Err(e) = self.drain(&application, &env, previous).await {
                warn!(%application, %env, %previous, error = %e, "failed to drain previous version");
            }
        }

        store.delete_file(&dangling)?;
        info!(
            %application,
            %env,
            %version,
            worker = %placement.worker,
            instance = %placement.instance,
            port = placement.port,
            "upgrade complete"
        );
        Ok(placement)
    }

    /// Stop every recorded instance of `version` in `env` and forget them.
    ///
    /// Returns the number of stop requests queued.
    pub async fn drain(
        &self,
        application: &str,
        env: &str,
        version: &str,
    ) -> RegistryResult<usize> {
        let store = &self.inner.store;
        let dir = paths::active_version(application, env, version);

        let mut stops = Vec::new();
        for worker in store.list(&dir)? {
            for instance in store.list(&paths::active_worker(application, env, version, &worker))? {
                stops.push((worker.clone(), instance));
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            for (worker, instance) in &stops {
                state.enqueue_stop(worker, instance);
            }
        }

        store.delete_tree(&dir)?;
        info!(%application, %env, %version, stopped = stops.len(), "previous version drained");
        Ok(stops.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::stream;
    use tokio::io::AsyncReadExt;

    use dockyard_core::PingRequest;
    use dockyard_state::ActivePlacement;

    use super::*;
    use crate::registry::testing::{TestRegistry, config, registry, registry_with};

    fn body(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, String>> + Unpin {
        let items: Vec<Result<Bytes, String>> = parts
            .iter()
            .copied()
            .map(|p| Ok(Bytes::from_static(p.as_bytes())))
            .collect();
        stream::iter(items)
    }

    fn client(t: &TestRegistry) -> String {
        t.registry.create_client(&t.master_key, "alice").unwrap().key
    }

    fn seed_version(t: &TestRegistry, app: &str, version: &str) {
        t.registry
            .store()
            .write_file(&paths::image_id(app, version), b"img")
            .unwrap();
    }

    async fn enroll(t: &TestRegistry, name: &str) -> String {
        let key = t.registry.create_worker(&t.master_key, name).unwrap().key;
        heartbeat(t, name, &key).await;
        key
    }

    async fn heartbeat(t: &TestRegistry, name: &str, key: &str) -> dockyard_core::PingResponse {
        let request = PingRequest {
            name: name.to_string(),
            key: key.to_string(),
            cpu_usage: 0.0,
            endpoint: None,
        };
        t.registry.ping(&request).await.unwrap()
    }

    async fn wait_pending(t: &TestRegistry) {
        for _ in 0..1_000 {
            if t.registry.cluster_status().await.pending > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("upgrade never queued a start");
    }

    /// Run an upgrade to completion with `worker` confirming on `port`.
    async fn complete_upgrade(
        t: &TestRegistry,
        ckey: &str,
        wkey: &str,
        version: &str,
        port: u16,
    ) -> Placement {
        let registry = t.registry.clone();
        let ckey = ckey.to_string();
        let version = version.to_string();
        let task = tokio::spawn(async move {
            registry
                .upgrade("alice", &ckey, "myapp", &version, "prod", &CancellationToken::new())
                .await
        });
        wait_pending(t).await;
        let response = heartbeat(t, "w1", wkey).await;
        t.registry
            .report_started("w1", &response.start[0].instance, port)
            .await
            .unwrap();
        task.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn push_stores_record_and_artifact() {
        let t = registry();
        let key = client(&t);

        let record = t
            .registry
            .push("alice", &key, "MyApp", "1", "sha256:abc", body(&["image ", "bytes"]))
            .await
            .unwrap();
        assert_eq!(record.application, "myapp");
        assert_eq!(record.size, 11);

        let store = t.registry.store();
        assert_eq!(
            store.read_string(&paths::image_id("myapp", "1")).unwrap().as_deref(),
            Some("sha256:abc")
        );
        assert!(store.exists(&paths::envs("myapp")).unwrap());
    }

    #[tokio::test]
    async fn second_push_conflicts_and_keeps_first_artifact() {
        let t = registry();
        let key = client(&t);
        t.registry
            .push("alice", &key, "myapp", "1", "img-a", body(&["first"]))
            .await
            .unwrap();

        let result = t
            .registry
            .push("alice", &key, "myapp", "1", "img-b", body(&["second"]))
            .await;
        assert!(matches!(result, Err(RegistryError::VersionExists { .. })));

        let wkey = t.registry.create_worker(&t.master_key, "w1").unwrap().key;
        let (mut file, size) = t.registry.pull("w1", &wkey, "myapp", "1").await.unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).await.unwrap();
        assert_eq!((contents.as_str(), size), ("first", 5));
    }

    #[tokio::test]
    async fn failed_push_can_be_retried() {
        let t = registry();
        let key = client(&t);
        let broken = stream::iter(vec![Ok(Bytes::from_static(b"half")), Err("reset".to_string())]);

        let result = t.registry.push("alice", &key, "myapp", "1", "img", broken).await;
        assert!(matches!(result, Err(RegistryError::Artifact(_))));
        assert!(!t.registry.store().exists(&paths::version("myapp", "1")).unwrap());

        t.registry
            .push("alice", &key, "myapp", "1", "img", body(&["whole"]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn push_requires_client_credentials() {
        let t = registry();
        client(&t);
        let result = t
            .registry
            .push("alice", "wrong", "myapp", "1", "img", body(&["x"]))
            .await;
        assert!(matches!(result, Err(RegistryError::Unauthorized(_))));
        assert!(!t.registry.store().exists(&paths::application("myapp")).unwrap());
    }

    #[tokio::test]
    async fn pull_unknown_version_is_not_found() {
        let t = registry();
        let wkey = t.registry.create_worker(&t.master_key, "w1").unwrap().key;
        assert!(matches!(
            t.registry.pull("w1", &wkey, "myapp", "1").await,
            Err(RegistryError::NotFound(_))
        ));
        assert!(matches!(
            t.registry.pull("w1", "bad", "myapp", "1").await,
            Err(RegistryError::Unauthorized(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn first_upgrade_sets_latest_and_records_placement() {
        let t = registry();
        let ckey = client(&t);
        seed_version(&t, "myapp", "1");
        let wkey = enroll(&t, "w1").await;

        let placement = complete_upgrade(&t, &ckey, &wkey, "1", 8080).await;
        assert_eq!(t.registry.latest("myapp", "prod").unwrap().as_deref(), Some("1"));

        let store = t.registry.store();
        assert!(!store.exists(&paths::dangling("myapp", "prod")).unwrap());
        let record: ActivePlacement = store
            .get_json(&paths::active_instance("myapp", "prod", "1", "w1", &placement.instance))
            .unwrap()
            .unwrap();
        assert_eq!(record.port, 8080);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_upgrade_is_rejected() {
        let t = registry();
        let ckey = client(&t);
        seed_version(&t, "myapp", "1");
        seed_version(&t, "myapp", "2");
        enroll(&t, "w1").await;

        let registry = t.registry.clone();
        let key = ckey.clone();
        let _first = tokio::spawn(async move {
            registry
                .upgrade("alice", &key, "myapp", "1", "prod", &CancellationToken::new())
                .await
        });
        wait_pending(&t).await;

        let second = t
            .registry
            .upgrade("alice", &ckey, "myapp", "2", "prod", &CancellationToken::new())
            .await;
        assert!(matches!(second, Err(RegistryError::UpgradeInProgress { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_to_missing_version_changes_nothing() {
        let t = registry();
        let ckey = client(&t);
        let result = t
            .registry
            .upgrade("alice", &ckey, "myapp", "7", "prod", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
        assert!(!t.registry.store().exists(&paths::env("myapp", "prod")).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upgrade_releases_lock() {
        let mut config = config();
        config.registry.max_placement_attempts = Some(2);
        let t = registry_with(config);
        let ckey = client(&t);
        seed_version(&t, "myapp", "1");

        let result = t
            .registry
            .upgrade("alice", &ckey, "myapp", "1", "prod", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RegistryError::PlacementExhausted(2))));

        let store = t.registry.store();
        assert!(!store.exists(&paths::dangling("myapp", "prod")).unwrap());
        assert!(!store.exists(&paths::active_version("myapp", "prod", "1")).unwrap());
        assert_eq!(t.registry.latest("myapp", "prod").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn upgrade_drains_previous_version() {
        let t = registry();
        let ckey = client(&t);
        seed_version(&t, "myapp", "1");
        seed_version(&t, "myapp", "2");
        let wkey = enroll(&t, "w1").await;

        let old = complete_upgrade(&t, &ckey, &wkey, "1", 8080).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        complete_upgrade(&t, &ckey, &wkey, "2", 8081).await;

        assert_eq!(t.registry.latest("myapp", "prod").unwrap().as_deref(), Some("2"));
        let store = t.registry.store();
        assert!(!store.exists(&paths::active_version("myapp", "prod", "1")).unwrap());
        assert_eq!(store.list(&paths::active_versions("myapp", "prod")).unwrap(), vec!["2"]);

        let response = heartbeat(&t, "w1", &wkey).await;
        assert_eq!(response.stop.len(), 1);
        assert_eq!(response.stop[0].instance, old.instance);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_holds_stops_for_worker_not_yet_seen() {
        let t = registry();
        let wkey = t.registry.create_worker(&t.master_key, "w9").unwrap().key;
        let record = ActivePlacement {
            instance: "i9".to_string(),
            worker: "w9".to_string(),
            port: 8080,
            placed_at: epoch_secs(),
        };
        t.registry
            .store()
            .put_json(&paths::active_instance("myapp", "prod", "1", "w9", "i9"), &record)
            .unwrap();

        assert_eq!(t.registry.drain("myapp", "prod", "1").await.unwrap(), 1);
        let status = t.registry.cluster_status().await;
        assert!(!status.workers[0].up);
        assert_eq!(status.workers[0].mailbox_depth, 1);

        let response = heartbeat(&t, "w9", &wkey).await;
        assert_eq!(response.stop.len(), 1);
        assert_eq!(response.stop[0].instance, "i9");
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_after_placement_releases_lock() {
        let t = registry();
        let ckey = client(&t);
        seed_version(&t, "myapp", "1");
        let wkey = enroll(&t, "w1").await;

        let registry = t.registry.clone();
        let key = ckey.clone();
        let task = tokio::spawn(async move {
            registry
                .upgrade("alice", &key, "myapp", "1", "prod", &CancellationToken::new())
                .await
        });
        wait_pending(&t).await;

        // A directory where `latest` belongs makes the final write fail.
        let latest = paths::latest("myapp", "prod");
        t.registry.store().create_dir(&latest).unwrap();
        let response = heartbeat(&t, "w1", &wkey).await;
        t.registry
            .report_started("w1", &response.start[0].instance, 8080)
            .await
            .unwrap();
        assert!(matches!(task.await.unwrap(), Err(RegistryError::State(_))));
        assert!(!t.registry.store().exists(&paths::dangling("myapp", "prod")).unwrap());

        t.registry.store().delete_tree(&latest).unwrap();
        complete_upgrade(&t, &ckey, &wkey, "1", 8081).await;
        assert_eq!(t.registry.latest("myapp", "prod").unwrap().as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn previous_version_kept_when_draining_disabled() {
        let mut config = config();
        config.registry.drain_previous = false;
        let t = registry_with(config);
        let ckey = client(&t);
        seed_version(&t, "myapp", "1");
        seed_version(&t, "myapp", "2");
        let wkey = enroll(&t, "w1").await;

        complete_upgrade(&t, &ckey, &wkey, "1", 8080).await;
        complete_upgrade(&t, &ckey, &wkey, "2", 8081).await;

        let store = t.registry.store();
        assert_eq!(
            store.list(&paths::active_versions("myapp", "prod")).unwrap(),
            vec!["1", "2"]
        );
        assert!(heartbeat(&t, "w1", &wkey).await.stop.is_empty());
    }
}
