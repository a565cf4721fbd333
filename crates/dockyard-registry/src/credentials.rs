//! Enrollment and authentication.
//!
//! Keys are stored as plain files under `workers/<w>/key` and
//! `clients/<c>/key`. Comparison is constant-time; unknown identities and
//! malformed names fail the same way as a wrong key.

use tracing::{info, warn};

use dockyard_core::crypto::keys_match;
use dockyard_core::{CredentialsResponse, names};
use dockyard_state::paths::registry as paths;

use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;

impl Registry {
    fn verify_master(&self, presented: &str) -> RegistryResult<()> {
        let expected = self
            .inner
            .store
            .read_string(paths::REGISTRY_KEY)?
            .ok_or(RegistryError::NotInstalled)?;
        if keys_match(&expected, presented) {
            Ok(())
        } else {
            warn!("enrollment with invalid master key");
            Err(RegistryError::Unauthorized("invalid registry key".to_string()))
        }
    }

    fn verify_key(&self, path: &str, presented: &str, who: &str) -> RegistryResult<()> {
        match self.inner.store.read_string(path)? {
            Some(expected) if keys_match(&expected, presented) => Ok(()),
            _ => {
                warn!(identity = %who, "authentication failed");
                Err(RegistryError::Unauthorized(who.to_string()))
            }
        }
    }

    /// Check a worker's `(name, key)`. Returns the sanitized name.
    pub fn verify_worker(&self, name: &str, key: &str) -> RegistryResult<String> {
        let name = names::worker(name)
            .map_err(|_| RegistryError::Unauthorized(format!("worker {name:?}")))?;
        self.verify_key(&paths::worker_key(&name), key, &format!("worker {name}"))?;
        Ok(name)
    }

    /// Check a client's `(username, key)`. Returns the sanitized username.
    pub fn verify_client(&self, username: &str, key: &str) -> RegistryResult<String> {
        let username = names::username(username)
            .map_err(|_| RegistryError::Unauthorized(format!("client {username:?}")))?;
        self.verify_key(&paths::client_key(&username), key, &format!("client {username}"))?;
        Ok(username)
    }

    /// Enroll a worker. Requires the registry master key.
    pub fn create_worker(
        &self,
        master_key: &str,
        name: &str,
    ) -> RegistryResult<CredentialsResponse> {
        self.verify_master(master_key)?;
        let name = names::worker(name)?;
        let key = self.inner.crypto.create_key();
        if !self.inner.store.create_file(&paths::worker_key(&name), key.as_bytes())? {
            return Err(RegistryError::WorkerExists(name));
        }
        info!(worker = %name, "worker enrolled");
        Ok(CredentialsResponse {
            key,
            name: self.inner.name.clone(),
        })
    }

    /// Enroll a client. Requires the registry master key.
    pub fn create_client(
        &self,
        master_key: &str,
        username: &str,
    ) -> RegistryResult<CredentialsResponse> {
        self.verify_master(master_key)?;
        let username = names::username(username)?;
        let key = self.inner.crypto.create_key();
        if !self.inner.store.create_file(&paths::client_key(&username), key.as_bytes())? {
            return Err(RegistryError::ClientExists(username));
        }
        info!(client = %username, "client enrolled");
        Ok(CredentialsResponse {
            key,
            name: self.inner.name.clone(),
        })
    }
}
