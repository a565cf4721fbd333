//! StateStore — redb-backed path hierarchy for Dockyard.
//!
//! Files and directory markers live in two tables keyed by normalized
//! `/`-separated paths. Every mutating operation runs in its own write
//! transaction, which makes the check-then-insert operations
//! ([`StateStore::create_file`], [`StateStore::create_dir`]) atomic with
//! respect to each other. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(FILES).map_err(map_err!(Table))?;
        txn.open_table(DIRS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Whether a file or directory exists at `path`.
    pub fn exists(&self, path: &str) -> StateResult<bool> {
        let path = normalize(path)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let files = txn.open_table(FILES).map_err(map_err!(Table))?;
        if files.get(path.as_str()).map_err(map_err!(Read))?.is_some() {
            return Ok(true);
        }
        let dirs = txn.open_table(DIRS).map_err(map_err!(Table))?;
        Ok(dirs.get(path.as_str()).map_err(map_err!(Read))?.is_some())
    }

    /// Read a file's contents.
    pub fn read_file(&self, path: &str) -> StateResult<Option<Vec<u8>>> {
        let path = normalize(path)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FILES).map_err(map_err!(Table))?;
        Ok(table
            .get(path.as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }

    /// Read a file as UTF-8 text.
    pub fn read_string(&self, path: &str) -> StateResult<Option<String>> {
        match self.read_file(path)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    /// Read and deserialize a JSON file.
    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> StateResult<Option<T>> {
        match self.read_file(path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(map_err!(Deserialize)),
            None => Ok(None),
        }
    }

    /// Names of the immediate children (files and directories) of `dir`,
    /// sorted. An empty `dir` lists the root.
    pub fn list(&self, dir: &str) -> StateResult<Vec<String>> {
        let prefix = child_prefix(dir)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let mut names = BTreeSet::new();
        let files = txn.open_table(FILES).map_err(map_err!(Table))?;
        collect_children(&files, &prefix, &mut names)?;
        let dirs = txn.open_table(DIRS).map_err(map_err!(Table))?;
        collect_children(&dirs, &prefix, &mut names)?;
        Ok(names.into_iter().collect())
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Create a directory (and any missing parents).
    ///
    /// Returns `false` when the directory already existed.
    pub fn create_dir(&self, path: &str) -> StateResult<bool> {
        let path = normalize(path)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created;
        {
            let mut files = txn.open_table(FILES).map_err(map_err!(Table))?;
            let mut dirs = txn.open_table(DIRS).map_err(map_err!(Table))?;
            if files.get(path.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(path));
            }
            created = dirs.get(path.as_str()).map_err(map_err!(Read))?.is_none();
            ensure_parents(&mut files, &mut dirs, &path)?;
            if created {
                dirs.insert(path.as_str(), [].as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, created, "directory ensured");
        Ok(created)
    }

    /// Create a file only if nothing exists at `path` yet.
    ///
    /// Returns `false` (and writes nothing) when the path is taken.
    pub fn create_file(&self, path: &str, contents: &[u8]) -> StateResult<bool> {
        let path = normalize(path)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut files = txn.open_table(FILES).map_err(map_err!(Table))?;
            let mut dirs = txn.open_table(DIRS).map_err(map_err!(Table))?;
            let taken = files.get(path.as_str()).map_err(map_err!(Read))?.is_some()
                || dirs.get(path.as_str()).map_err(map_err!(Read))?.is_some();
            if taken {
                return Ok(false);
            }
            ensure_parents(&mut files, &mut dirs, &path)?;
            files
                .insert(path.as_str(), contents)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, "file created");
        Ok(true)
    }

    /// Create or overwrite a file.
    pub fn write_file(&self, path: &str, contents: &[u8]) -> StateResult<()> {
        let path = normalize(path)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut files = txn.open_table(FILES).map_err(map_err!(Table))?;
            let mut dirs = txn.open_table(DIRS).map_err(map_err!(Table))?;
            if dirs.get(path.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(path));
            }
            ensure_parents(&mut files, &mut dirs, &path)?;
            files
                .insert(path.as_str(), contents)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Serialize `value` as JSON and write it to `path`.
    pub fn put_json<T: Serialize>(&self, path: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        self.write_file(path, &bytes)
    }

    /// Serialize `value` as JSON and create it at `path` if absent.
    pub fn create_json<T: Serialize>(&self, path: &str, value: &T) -> StateResult<bool> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        self.create_file(path, &bytes)
    }

    /// Delete a single file. Returns true if it existed.
    pub fn delete_file(&self, path: &str) -> StateResult<bool> {
        let path = normalize(path)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(FILES).map_err(map_err!(Table))?;
            existed = table.remove(path.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, existed, "file deleted");
        Ok(existed)
    }

    /// Delete `path` and everything below it. Returns the number of
    /// entries (files and directories) removed.
    pub fn delete_tree(&self, path: &str) -> StateResult<u32> {
        let path = normalize(path)?;
        let prefix = format!("{path}/");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut count = 0;
        {
            let mut files = txn.open_table(FILES).map_err(map_err!(Table))?;
            count += remove_subtree(&mut files, &path, &prefix)?;
            let mut dirs = txn.open_table(DIRS).map_err(map_err!(Table))?;
            count += remove_subtree(&mut dirs, &path, &prefix)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, count, "tree deleted");
        Ok(count)
    }
}

// ── Path helpers ───────────────────────────────────────────────────

/// Strip surrounding slashes and reject empty, `.` and `..` segments.
fn normalize(path: &str) -> StateResult<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty()
        || trimmed
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StateError::InvalidPath(path.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Key prefix shared by all children of `dir` (`""` for the root).
fn child_prefix(dir: &str) -> StateResult<String> {
    if dir.trim_matches('/').is_empty() {
        return Ok(String::new());
    }
    Ok(format!("{}/", normalize(dir)?))
}

fn collect_children<T>(table: &T, prefix: &str, out: &mut BTreeSet<String>) -> StateResult<()>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        let Some(rest) = key.strip_prefix(prefix) else {
            break;
        };
        if let Some(child) = rest.split('/').next().filter(|c| !c.is_empty()) {
            out.insert(child.to_string());
        }
    }
    Ok(())
}

/// Insert directory markers for every ancestor of `path`.
fn ensure_parents(
    files: &mut Table<&'static str, &'static [u8]>,
    dirs: &mut Table<&'static str, &'static [u8]>,
    path: &str,
) -> StateResult<()> {
    let mut end = 0;
    while let Some(offset) = path[end..].find('/') {
        end += offset;
        let ancestor = &path[..end];
        if files.get(ancestor).map_err(map_err!(Read))?.is_some() {
            return Err(StateError::InvalidPath(format!(
                "{path}: ancestor {ancestor} is a file"
            )));
        }
        if dirs.get(ancestor).map_err(map_err!(Read))?.is_none() {
            dirs.insert(ancestor, [].as_slice()).map_err(map_err!(Write))?;
        }
        end += 1;
    }
    Ok(())
}

fn remove_subtree(
    table: &mut Table<&'static str, &'static [u8]>,
    path: &str,
    prefix: &str,
) -> StateResult<u32> {
    let mut keys = vec![path.to_string()];
    for entry in table.range(prefix..).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }

    let mut removed = 0;
    for key in &keys {
        if table.remove(key.as_str()).map_err(map_err!(Write))?.is_some() {
            removed += 1;
        }
    }
    Ok(removed)
}
