//! Storage backend trait definition.

use crate::error::StorageResult;

/// A keyed blob store.
///
/// # Invariants
///
/// - `read` returns exactly the bytes of the last successful `write` for a key
/// - `write` replaces the whole value atomically; a reader never observes a
///   partially written value
/// - `keys` returns keys in ascending byte order
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::DirectoryBackend`] - For persistent staging
pub trait StorageBackend: Send + Sync {
    /// Reads the value stored under `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `data` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Returns `true` if a value was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is invalid or an I/O error occurs.
    fn remove(&self, key: &str) -> StorageResult<bool>;

    /// Lists all keys starting with `prefix`, sorted ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Flushes all written values to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&self) -> StorageResult<()>;

    /// Removes every key starting with `prefix` and returns how many went.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while listing or removing.
    fn remove_prefix(&self, prefix: &str) -> StorageResult<usize> {
        let mut removed = 0;
        for key in self.keys(prefix)? {
            if self.remove(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
