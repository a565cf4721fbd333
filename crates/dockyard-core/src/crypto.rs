//! The `Crypto` capability — key, id and port generation.
//!
//! The registry and the worker agent receive an `Arc<dyn Crypto>` instead of
//! calling the generators directly, so tests can substitute deterministic
//! implementations.

use std::net::{Ipv4Addr, TcpListener};

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Length of generated authentication keys.
pub const KEY_LENGTH: usize = 64;

/// Source of secrets, identifiers and free ports.
pub trait Crypto: Send + Sync {
    /// A random authentication key.
    fn create_key(&self) -> String;

    /// A random opaque identifier (instance ids, temp file names).
    fn create_id(&self) -> String;

    /// A TCP port that is currently free on this host.
    fn free_port(&self) -> std::io::Result<u16>;
}

/// Operating-system backed [`Crypto`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OsCrypto;

impl Crypto for OsCrypto {
    fn create_key(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(KEY_LENGTH)
            .map(char::from)
            .collect()
    }

    fn create_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    fn free_port(&self) -> std::io::Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        Ok(listener.local_addr()?.port())
    }
}

/// Compare two keys without short-circuiting on the first differing byte.
pub fn keys_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
