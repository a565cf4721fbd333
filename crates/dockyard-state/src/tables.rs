//! redb table definitions for the Dockyard state store.
//!
//! The store models a directory hierarchy. Both tables are keyed by
//! `/`-separated paths without leading or trailing slashes
//! (`applications/myapp/envs/prod/latest`).

use redb::TableDefinition;

/// File contents keyed by path.
pub const FILES: TableDefinition<&str, &[u8]> = TableDefinition::new("files");

/// Directory markers keyed by path. Values are empty.
pub const DIRS: TableDefinition<&str, &[u8]> = TableDefinition::new("dirs");
