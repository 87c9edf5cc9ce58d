//! Server snapshots shared between the scope registry and sessions.

use scopesync_core::BatchInfo;
use std::sync::Arc;

/// Every row of a scope, materialized at one timestamp.
///
/// The scope keeps the current snapshot and every session streaming one
/// holds the snapshot it started with, so replacing a snapshot never changes
/// what an in-flight download receives. Staged parts are removed when the
/// last holder lets go.
#[derive(Debug)]
pub struct Snapshot {
    batch: BatchInfo,
}

impl Snapshot {
    /// Wraps a complete batch.
    pub fn new(batch: BatchInfo) -> Arc<Self> {
        Arc::new(Self { batch })
    }

    /// The snapshot's parts.
    pub fn batch(&self) -> &BatchInfo {
        &self.batch
    }

    /// Server timestamp the rows were read at.
    pub fn timestamp(&self) -> u64 {
        self.batch.timestamp()
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        if let Err(e) = self.batch.clear() {
            tracing::warn!(batch_id = self.batch.id(), error = %e, "failed to clear snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_core::{create_parts, Change, RowState, SyncRow, Value};
    use scopesync_storage::{InMemoryBackend, StorageBackend};

    fn staged(backend: &Arc<InMemoryBackend>) -> BatchInfo {
        let changes = (0..3).map(|id| {
            Change::new(
                "items",
                SyncRow {
                    values: vec![Value::Integer(id)],
                    state: RowState::Modified,
                    timestamp: 1,
                    update_scope_id: None,
                },
            )
        });
        let shared: Arc<dyn StorageBackend> = backend.clone();
        create_parts(changes, 1, BatchInfo::staged(shared, 9)).unwrap()
    }

    #[test]
    fn staged_parts_live_until_the_last_holder_drops() {
        let backend = Arc::new(InMemoryBackend::new());
        let snapshot = Snapshot::new(staged(&backend));
        assert_eq!(snapshot.timestamp(), 9);
        let held = Arc::clone(&snapshot);

        drop(snapshot);
        assert_eq!(held.batch().part(2).unwrap().rows.len(), 1);
        assert_eq!(backend.keys("batch/").unwrap().len(), 3);

        drop(held);
        assert!(backend.keys("batch/").unwrap().is_empty());
    }
}
