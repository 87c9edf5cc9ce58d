//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use crate::key::validate_key;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory storage backend.
///
/// This backend keeps every value in a sorted map and is suitable for:
/// - Unit tests
/// - Servers that keep batch parts resident instead of staging them
///
/// # Example
///
/// ```rust
/// use scopesync_storage::{StorageBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.write("clock/high_water", &42u64.to_le_bytes()).unwrap();
/// assert_eq!(backend.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total bytes held across all values.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        validate_key(key)?;
        self.entries.write().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.entries.write().remove(key).is_some())
    }

    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn sync(&self) -> StorageResult<()> {
        // Nothing to make durable
        Ok(())
    }

    fn remove_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    #[test]
    fn write_read_remove() {
        let backend = InMemoryBackend::new();
        assert!(backend.is_empty());

        backend.write("batch/a/0", b"zero").unwrap();
        backend.write("batch/a/1", b"one").unwrap();
        assert_eq!(backend.read("batch/a/1").unwrap(), Some(b"one".to_vec()));
        assert_eq!(backend.total_bytes(), 7);

        assert!(backend.remove("batch/a/0").unwrap());
        assert!(!backend.remove("batch/a/0").unwrap());
        assert_eq!(backend.read("batch/a/0").unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_value() {
        let backend = InMemoryBackend::new();
        backend.write("k", b"first").unwrap();
        backend.write("k", b"second").unwrap();
        assert_eq!(backend.read("k").unwrap(), Some(b"second".to_vec()));
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn keys_are_prefix_scoped_and_sorted() {
        let backend = InMemoryBackend::new();
        backend.write("batch/b/1", b"").unwrap();
        backend.write("batch/a/0", b"").unwrap();
        backend.write("batch/ab/0", b"").unwrap();
        backend.write("clock/high_water", b"").unwrap();

        assert_eq!(
            backend.keys("batch/a/").unwrap(),
            vec!["batch/a/0".to_string()]
        );
        assert_eq!(backend.keys("batch/").unwrap().len(), 3);
        assert_eq!(backend.keys("").unwrap().len(), 4);
    }

    #[test]
    fn remove_prefix_clears_only_matching() {
        let backend = InMemoryBackend::new();
        backend.write("batch/a/0", b"x").unwrap();
        backend.write("batch/a/1", b"y").unwrap();
        backend.write("batch/b/0", b"z").unwrap();

        assert_eq!(backend.remove_prefix("batch/a/").unwrap(), 2);
        assert_eq!(backend.keys("batch/").unwrap(), vec!["batch/b/0".to_string()]);
    }

    #[test]
    fn invalid_key_rejected() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend.write("../escape", b"x"),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
