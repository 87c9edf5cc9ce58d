//! Error types for scopesync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in scopesync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] scopesync_storage::StorageError),

    /// A table or its tracking table is not provisioned.
    #[error("schema missing: {message}")]
    SchemaMissing {
        /// What is missing.
        message: String,
    },

    /// Two replicas disagree on a table definition.
    #[error("schema mismatch on table {table}: {message}")]
    SchemaMismatch {
        /// Table whose definition differs.
        table: String,
        /// Description of the difference.
        message: String,
    },

    /// A table descriptor or setup is malformed.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// A row does not fit its table descriptor.
    #[error("invalid row for table {table}: {message}")]
    InvalidRow {
        /// Table the row was meant for.
        table: String,
        /// Description of the problem.
        message: String,
    },

    /// A batch part arrived with an unexpected index.
    #[error("batch part out of order: expected index {expected}, got {actual}")]
    OutOfOrderBatchPart {
        /// The next index the receiver accepts.
        expected: u32,
        /// The index that arrived.
        actual: u32,
    },

    /// A batch part arrived after the last part was already received.
    #[error("batch {batch_id} already complete, got index {index}")]
    BatchAlreadyComplete {
        /// Batch identifier.
        batch_id: String,
        /// Index that arrived.
        index: u32,
    },

    /// A requested batch part does not exist.
    #[error("batch {batch_id} has no part {index}")]
    BatchPartNotFound {
        /// Batch identifier.
        batch_id: String,
        /// Requested index.
        index: u32,
    },

    /// Staged data could not be encoded or decoded.
    #[error("staging codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Scope record not found.
    #[error("scope not found: {name}")]
    ScopeNotFound {
        /// Scope name.
        name: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a schema missing error.
    pub fn schema_missing(message: impl Into<String>) -> Self {
        Self::SchemaMissing {
            message: message.into(),
        }
    }

    /// Creates a schema mismatch error.
    pub fn schema_mismatch(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates an invalid row error.
    pub fn invalid_row(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRow {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a staging codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true for errors that mean the replicas cannot agree on a model.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            CoreError::SchemaMissing { .. }
                | CoreError::SchemaMismatch { .. }
                | CoreError::InvalidSchema { .. }
        )
    }
}
