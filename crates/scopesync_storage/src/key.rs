//! Key validation shared by all backends.

use crate::error::{StorageError, StorageResult};

/// Checks that `key` is a relative, slash-separated path of non-empty
/// segments made of ASCII alphanumerics, `-`, `_` and `.` (but never `.` or
/// `..` alone).
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] when the key breaks any rule.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }

    for segment in key.split('/') {
        let allowed = segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if segment.is_empty() || segment == "." || segment == ".." || !allowed {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_batch_keys() {
        assert!(validate_key("batch/6f1c/0").is_ok());
        assert!(validate_key("clock/high_water").is_ok());
        assert!(validate_key("snapshot/v1.cbor").is_ok());
    }

    #[test]
    fn rejects_escaping_keys() {
        for key in ["", "/abs", "trailing/", "a//b", "../up", "a/./b", "sp ace"] {
            assert!(
                matches!(validate_key(key), Err(StorageError::InvalidKey(_))),
                "{key:?} should be rejected"
            );
        }
    }
}
