//! Directory-based storage backend for persistent staging.
//!
//! Layout:
//!
//! ```text
//! <root>/
//! ├─ LOCK                  # Advisory lock, one process per directory
//! ├─ clock/high_water
//! └─ batch/<batch id>/<index>
//! ```
//!
//! Every key maps to one file. Writes go to a `.tmp` sibling which is
//! fsynced and renamed over the target.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::key::validate_key;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const TEMP_SUFFIX: &str = ".tmp";

/// A file-per-key storage backend rooted at a directory.
///
/// The backend holds an exclusive advisory lock on `<root>/LOCK` for its
/// whole lifetime, so two processes can never stage into the same directory.
///
/// # Example
///
/// ```no_run
/// use scopesync_storage::{StorageBackend, DirectoryBackend};
/// use std::path::Path;
///
/// let backend = DirectoryBackend::open(Path::new("staging")).unwrap();
/// backend.write("batch/b1/0", b"rows").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct DirectoryBackend {
    root: PathBuf,
    _lock_file: File,
}

impl DirectoryBackend {
    /// Opens or creates a backend rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another handle holds the lock, or
    /// an I/O error if the directory cannot be created.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(root.to_path_buf()));
        }

        Ok(Self {
            root: root.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        if key == LOCK_FILE || key.ends_with(TEMP_SUFFIX) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(key.split('/').fold(self.root.clone(), |p, s| p.join(s)))
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> StorageResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().into_string().map_err(|name| {
                StorageError::Corrupted(format!("non UTF-8 file name {name:?}"))
            })?;
            let path = entry.path();
            let relative = path
                .strip_prefix(&self.root)
                .map_err(|_| StorageError::Corrupted(format!("stray path {}", path.display())))?
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/");

            if entry.file_type()?.is_dir() {
                self.collect_keys(&path, prefix, out)?;
            } else if name != LOCK_FILE
                && !name.ends_with(TEMP_SUFFIX)
                && relative.starts_with(prefix)
            {
                out.push(relative);
            }
        }
        Ok(())
    }

    fn prune_empty_dirs(&self, mut dir: Option<&Path>) {
        while let Some(current) = dir {
            if current == self.root.as_path() {
                break;
            }
            // Fails when not empty, which ends the walk
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }
}

impl StorageBackend for DirectoryBackend {
    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        let mut file = File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                self.prune_empty_dirs(path.parent());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }

    fn sync(&self) -> StorageResult<()> {
        // Values are fsynced on write; make the directory entries durable too.
        #[cfg(unix)]
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn values_survive_reopen() {
        let temp = tempdir().unwrap();
        {
            let backend = DirectoryBackend::open(temp.path()).unwrap();
            backend.write("clock/high_water", &7u64.to_le_bytes()).unwrap();
            backend.sync().unwrap();
        }

        let backend = DirectoryBackend::open(temp.path()).unwrap();
        assert_eq!(
            backend.read("clock/high_water").unwrap(),
            Some(7u64.to_le_bytes().to_vec())
        );
    }

    #[test]
    fn second_open_is_locked() {
        let temp = tempdir().unwrap();
        let _first = DirectoryBackend::open(temp.path()).unwrap();
        assert!(matches!(
            DirectoryBackend::open(temp.path()),
            Err(StorageError::Locked(_))
        ));
    }

    #[test]
    fn keys_skip_lock_and_nest() {
        let temp = tempdir().unwrap();
        let backend = DirectoryBackend::open(temp.path()).unwrap();
        backend.write("batch/b1/0", b"a").unwrap();
        backend.write("batch/b1/1", b"b").unwrap();
        backend.write("batch/b2/0", b"c").unwrap();

        assert_eq!(
            backend.keys("batch/b1/").unwrap(),
            vec!["batch/b1/0".to_string(), "batch/b1/1".to_string()]
        );
        assert_eq!(backend.keys("").unwrap().len(), 3);
    }

    #[test]
    fn remove_prefix_prunes_directories() {
        let temp = tempdir().unwrap();
        let backend = DirectoryBackend::open(temp.path()).unwrap();
        backend.write("batch/b1/0", b"a").unwrap();
        backend.write("batch/b1/1", b"b").unwrap();

        assert_eq!(backend.remove_prefix("batch/b1/").unwrap(), 2);
        assert!(!temp.path().join("batch").join("b1").exists());
        assert_eq!(backend.read("batch/b1/0").unwrap(), None);
    }

    #[test]
    fn lock_file_is_not_addressable() {
        let temp = tempdir().unwrap();
        let backend = DirectoryBackend::open(temp.path()).unwrap();
        assert!(matches!(
            backend.write("LOCK", b"x"),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
