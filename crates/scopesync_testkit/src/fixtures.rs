//! Replica fixtures and the canonical test schema.
//!
//! Two tables are used throughout the tests:
//! - `items (id INTEGER PRIMARY KEY, name TEXT NULL, qty INTEGER NULL)`
//! - `notes (owner TEXT, seq INTEGER, body TEXT NULL)` keyed on
//!   `(owner, seq)`

use scopesync_core::{
    ColumnDescriptor, ColumnType, PrimaryKey, Replica, ReplicaConfig, Row, SyncSetup,
    TableDescriptor, Value,
};
use scopesync_storage::{DirectoryBackend, StorageBackend};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Name of the single-key table.
pub const ITEMS: &str = "items";

/// Name of the composite-key table.
pub const NOTES: &str = "notes";

/// Scope name used by the fixtures.
pub const SCOPE: &str = "default";

/// Descriptor of [`ITEMS`].
pub fn items_table() -> TableDescriptor {
    TableDescriptor::new(
        ITEMS,
        vec![
            ColumnDescriptor::new("id", ColumnType::Integer),
            ColumnDescriptor::new("name", ColumnType::Text).nullable(),
            ColumnDescriptor::new("qty", ColumnType::Integer).nullable(),
        ],
        vec!["id".to_string()],
    )
}

/// Descriptor of [`NOTES`].
pub fn notes_table() -> TableDescriptor {
    TableDescriptor::new(
        NOTES,
        vec![
            ColumnDescriptor::new("owner", ColumnType::Text),
            ColumnDescriptor::new("seq", ColumnType::Integer),
            ColumnDescriptor::new("body", ColumnType::Text).nullable(),
        ],
        vec!["owner".to_string(), "seq".to_string()],
    )
}

/// Setup synchronizing both tables.
pub fn setup() -> SyncSetup {
    SyncSetup::new([ITEMS, NOTES])
}

/// An `items` row.
pub fn item(id: i64, name: &str) -> Row {
    vec![Value::Integer(id), Value::Text(name.to_string()), Value::Null]
}

/// An `items` row with a quantity.
pub fn item_with_qty(id: i64, name: &str, qty: i64) -> Row {
    vec![Value::Integer(id), Value::Text(name.to_string()), Value::Integer(qty)]
}

/// Key of an `items` row.
pub fn item_key(id: i64) -> PrimaryKey {
    PrimaryKey::from(id)
}

/// A `notes` row.
pub fn note(owner: &str, seq: i64, body: &str) -> Row {
    vec![
        Value::Text(owner.to_string()),
        Value::Integer(seq),
        Value::Text(body.to_string()),
    ]
}

/// Key of a `notes` row.
pub fn note_key(owner: &str, seq: i64) -> PrimaryKey {
    PrimaryKey::new(vec![Value::Text(owner.to_string()), Value::Integer(seq)])
}

/// A replica with both test tables created, kept alive together with its
/// temporary directory.
pub struct TestReplica {
    /// The replica.
    pub replica: Arc<Replica>,
    temp_dir: Option<TempDir>,
}

impl TestReplica {
    /// Creates an in-memory replica with both tables, unprovisioned.
    pub fn memory(name: &str) -> Self {
        let replica = Replica::in_memory(ReplicaConfig::new(name))
            .expect("Failed to open in-memory replica");
        Self::with_tables(replica, None)
    }

    /// Creates a replica over a fresh temporary directory.
    pub fn directory(name: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let replica = open_directory(temp_dir.path(), ReplicaConfig::new(name));
        Self::with_tables(replica, Some(temp_dir))
    }

    /// Creates a directory replica that stages batch parts to storage.
    pub fn staged(name: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = ReplicaConfig::new(name);
        config.stage_batches = true;
        let replica = open_directory(temp_dir.path(), config);
        Self::with_tables(replica, Some(temp_dir))
    }

    fn with_tables(replica: Replica, temp_dir: Option<TempDir>) -> Self {
        replica
            .create_table(items_table())
            .expect("Failed to create items");
        replica
            .create_table(notes_table())
            .expect("Failed to create notes");
        Self {
            replica: Arc::new(replica),
            temp_dir,
        }
    }

    /// Directory of a directory-backed replica.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Reopens a directory-backed replica, keeping only what storage holds.
    ///
    /// Tables are recreated empty; the id and clock come back from storage.
    /// Every shared handle of the replica must be dropped first.
    pub fn reopen(self) -> Self {
        let temp_dir = self.temp_dir.expect("Only directory replicas can reopen");
        let config = self.replica.config().clone();
        drop(self.replica);
        let replica = open_directory(temp_dir.path(), config);
        Self::with_tables(replica, Some(temp_dir))
    }

    /// Shares the replica.
    pub fn share(&self) -> Arc<Replica> {
        Arc::clone(&self.replica)
    }
}

impl std::ops::Deref for TestReplica {
    type Target = Replica;

    fn deref(&self) -> &Self::Target {
        &self.replica
    }
}

fn open_directory(path: &Path, config: ReplicaConfig) -> Replica {
    let backend: Arc<dyn StorageBackend> =
        Arc::new(DirectoryBackend::open(path).expect("Failed to open directory backend"));
    Replica::open(backend, config).expect("Failed to open replica")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_fit_their_tables() {
        items_table().check_row(&item(1, "pen")).unwrap();
        items_table().check_row(&item_with_qty(2, "ink", 3)).unwrap();
        notes_table().check_row(&note("ann", 1, "hi")).unwrap();
        assert_eq!(notes_table().key_of(&note("ann", 1, "hi")).unwrap(), note_key("ann", 1));
    }

    #[test]
    fn directory_replica_keeps_identity() {
        let replica = TestReplica::directory("client");
        let id = replica.id();
        let before = replica.local_timestamp().unwrap();
        let replica = replica.reopen();
        assert_eq!(replica.id(), id);
        assert!(replica.local_timestamp().unwrap() > before);
        assert_eq!(replica.row_count(ITEMS).unwrap(), 0);
    }
}
