//! Changes: one row's state as of a logical timestamp.

use crate::types::ScopeId;
use crate::value::Row;
use serde::{Deserialize, Serialize};

/// Whether a change carries data or marks a deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowState {
    /// The row exists with the carried values.
    Modified,
    /// The row was deleted; only key columns are meaningful.
    Tombstone,
}

/// A row as it travels in a batch part.
///
/// `timestamp` and `update_scope_id` are the sender's tracking metadata at
/// selection time. Receivers decide with their own tracking rows and stamp
/// their own clock values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRow {
    /// Column values in table order.
    pub values: Row,
    /// Modified or tombstone.
    pub state: RowState,
    /// Sender's tracking timestamp.
    pub timestamp: u64,
    /// Sender's `update_scope_id`.
    pub update_scope_id: Option<ScopeId>,
}

impl SyncRow {
    /// Returns true for tombstones.
    pub fn is_tombstone(&self) -> bool {
        self.state == RowState::Tombstone
    }
}

/// A selected change, tagged with its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Table the row belongs to.
    pub table: String,
    /// The row.
    pub row: SyncRow,
}

impl Change {
    /// Creates a change.
    pub fn new(table: impl Into<String>, row: SyncRow) -> Self {
        Self {
            table: table.into(),
            row,
        }
    }
}
