//! Store path layout.
//!
//! Every argument must already be sanitized (see `dockyard_core::names`);
//! these helpers only join segments.
//!
//! ```text
//! registry root                         worker root
//! ├── registry-key                      ├── key
//! ├── registry-name                     ├── name
//! ├── workers/<w>/key                   ├── cluster
//! ├── clients/<c>/key                   ├── host
//! └── applications/<a>/                 ├── endpoint
//!     ├── versions/<v>/                 └── instances/<i>/
//!     │   ├── image-id                      ├── application
//!     │   └── record                        ├── version
//!     └── envs/<e>/                         └── env
//!         ├── latest
//!         ├── dangling
//!         └── active-versions/<v>/<w>/<instance>
//! ```

/// Registry-side paths.
pub mod registry {
    pub const REGISTRY_KEY: &str = "registry-key";
    pub const REGISTRY_NAME: &str = "registry-name";
    pub const WORKERS: &str = "workers";
    pub const CLIENTS: &str = "clients";
    pub const APPLICATIONS: &str = "applications";

    pub fn worker_key(worker: &str) -> String {
        format!("{WORKERS}/{worker}/key")
    }

    pub fn client_key(username: &str) -> String {
        format!("{CLIENTS}/{username}/key")
    }

    pub fn application(app: &str) -> String {
        format!("{APPLICATIONS}/{app}")
    }

    pub fn versions(app: &str) -> String {
        format!("{APPLICATIONS}/{app}/versions")
    }

    pub fn version(app: &str, version: &str) -> String {
        format!("{APPLICATIONS}/{app}/versions/{version}")
    }

    pub fn image_id(app: &str, version: &str) -> String {
        format!("{}/image-id", self::version(app, version))
    }

    pub fn version_record(app: &str, version: &str) -> String {
        format!("{}/record", self::version(app, version))
    }

    pub fn envs(app: &str) -> String {
        format!("{APPLICATIONS}/{app}/envs")
    }

    pub fn env(app: &str, env: &str) -> String {
        format!("{APPLICATIONS}/{app}/envs/{env}")
    }

    pub fn latest(app: &str, env: &str) -> String {
        format!("{}/latest", self::env(app, env))
    }

    pub fn dangling(app: &str, env: &str) -> String {
        format!("{}/dangling", self::env(app, env))
    }

    pub fn active_versions(app: &str, env: &str) -> String {
        format!("{}/active-versions", self::env(app, env))
    }

    pub fn active_version(app: &str, env: &str, version: &str) -> String {
        format!("{}/{version}", active_versions(app, env))
    }

    pub fn active_worker(app: &str, env: &str, version: &str, worker: &str) -> String {
        format!("{}/{worker}", active_version(app, env, version))
    }

    pub fn active_instance(
        app: &str,
        env: &str,
        version: &str,
        worker: &str,
        instance: &str,
    ) -> String {
        format!("{}/{instance}", active_worker(app, env, version, worker))
    }
}

/// Worker-side paths.
pub mod worker {
    pub const KEY: &str = "key";
    pub const NAME: &str = "name";
    pub const CLUSTER: &str = "cluster";
    pub const HOST: &str = "host";
    pub const ENDPOINT: &str = "endpoint";
    pub const INSTANCES: &str = "instances";

    pub fn instance(instance: &str) -> String {
        format!("{INSTANCES}/{instance}")
    }

    pub fn instance_application(instance: &str) -> String {
        format!("{INSTANCES}/{instance}/application")
    }

    pub fn instance_version(instance: &str) -> String {
        format!("{INSTANCES}/{instance}/version")
    }

    pub fn instance_env(instance: &str) -> String {
        format!("{INSTANCES}/{instance}/env")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_layout() {
        assert_eq!(registry::worker_key("w1"), "workers/w1/key");
        assert_eq!(
            registry::image_id("myapp", "1"),
            "applications/myapp/versions/1/image-id"
        );
        assert_eq!(
            registry::active_instance("myapp", "prod", "1", "w1", "abc"),
            "applications/myapp/envs/prod/active-versions/1/w1/abc"
        );
    }

    #[test]
    fn worker_layout() {
        assert_eq!(worker::instance_env("abc"), "instances/abc/env");
    }
}
