//! Change applier: the conflict rule for writing one incoming row.
//!
//! An incoming row is accepted iff at least one of these holds for the local
//! tracking row of the same key:
//!
//! 1. its `timestamp` is at most the sender's `client_min_timestamp`
//! 2. its `update_scope_id` is the sender's scope id
//! 3. the write is forced
//! 4. it does not exist
//!
//! Otherwise the row is a conflict, which a [`ConflictResolver`] settles.
//! A conflict is never an error; it is counted in [`ApplyStats`].

use crate::change::SyncRow;
use crate::clock::LogicalClock;
use crate::error::CoreResult;
use crate::schema::TableDescriptor;
use crate::tracking::{RemoteWrite, TrackedTable, TrackingRow};
use crate::types::ScopeId;
use crate::value::PrimaryKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Which side of the exchange is writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyRole {
    /// The server applies rows uploaded by a client.
    Server,
    /// The client applies rows downloaded from the server.
    Client,
}

/// Resolution for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// Keep the local row; the incoming row is dropped.
    KeepLocal,
    /// Overwrite with the incoming row.
    AcceptRemote,
}

/// A detected conflict handed to a resolver.
#[derive(Debug)]
pub struct Conflict<'a> {
    /// Table name.
    pub table: &'a str,
    /// Row key.
    pub key: &'a PrimaryKey,
    /// Local tracking row that is newer than the sender knew.
    pub local: &'a TrackingRow,
    /// Incoming row.
    pub remote: &'a SyncRow,
    /// Side doing the write.
    pub role: ApplyRole,
}

/// Strategy deciding the winner of a conflict.
pub trait ConflictResolver: Send + Sync {
    /// Chooses which version survives.
    fn resolve(&self, conflict: &Conflict<'_>) -> ConflictResolution;
}

/// Built-in conflict policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// The server's version wins.
    #[default]
    ServerWins,
    /// The client's version wins.
    ClientWins,
}

impl ConflictResolver for ConflictPolicy {
    fn resolve(&self, conflict: &Conflict<'_>) -> ConflictResolution {
        match (self, conflict.role) {
            (ConflictPolicy::ServerWins, ApplyRole::Server)
            | (ConflictPolicy::ClientWins, ApplyRole::Client) => ConflictResolution::KeepLocal,
            (ConflictPolicy::ServerWins, ApplyRole::Client)
            | (ConflictPolicy::ClientWins, ApplyRole::Server) => ConflictResolution::AcceptRemote,
        }
    }
}

/// The accept rule, without side effects.
pub fn should_accept(
    local: Option<&TrackingRow>,
    sender: ScopeId,
    client_min_timestamp: u64,
    force_write: bool,
) -> bool {
    match local {
        None => true,
        Some(local) => {
            local.timestamp <= client_min_timestamp
                || local.update_scope_id == Some(sender)
                || force_write
        }
    }
}

/// Outcome of applying one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Accepted by the rule and written.
    Applied,
    /// A conflict, settled by the resolver.
    Conflict(ConflictResolution),
    /// The row changed between decision and write; nothing was written.
    ConcurrentlyModified,
}

/// Parameters shared by every row of one apply pass.
pub struct ApplyContext<'a> {
    /// Scope id of the replica that sent the rows.
    pub sender: ScopeId,
    /// Highest local timestamp the sender is known to have seen.
    pub client_min_timestamp: u64,
    /// Bypass the rule.
    pub force_write: bool,
    /// Side doing the write.
    pub role: ApplyRole,
    /// Conflict strategy.
    pub resolver: &'a dyn ConflictResolver,
}

impl std::fmt::Debug for ApplyContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyContext")
            .field("sender", &self.sender)
            .field("client_min_timestamp", &self.client_min_timestamp)
            .field("force_write", &self.force_write)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Applies one incoming row to `table`.
///
/// The decision is taken against a snapshot of the tracking row; the write
/// only happens if that tracking row is unchanged, otherwise the outcome is
/// [`ApplyOutcome::ConcurrentlyModified`].
///
/// # Errors
///
/// Returns `SchemaMissing` if the table is unprovisioned and `InvalidRow` if
/// the row does not fit `view`.
pub fn apply_row(
    table: &RwLock<TrackedTable>,
    view: &TableDescriptor,
    row: &SyncRow,
    clock: &LogicalClock,
    ctx: &ApplyContext<'_>,
) -> CoreResult<ApplyOutcome> {
    let key = view.key_of(&row.values)?;
    let local = table.read().tracking_row(&key)?.cloned();

    let mut outcome = ApplyOutcome::Applied;
    if !should_accept(
        local.as_ref(),
        ctx.sender,
        ctx.client_min_timestamp,
        ctx.force_write,
    ) {
        if let Some(local) = local.as_ref() {
            let resolution = ctx.resolver.resolve(&Conflict {
                table: &view.name,
                key: &key,
                local,
                remote: row,
                role: ctx.role,
            });
            tracing::debug!(
                table = %view.name,
                key = %key,
                local_timestamp = local.timestamp,
                client_min_timestamp = ctx.client_min_timestamp,
                ?resolution,
                "conflict"
            );
            if resolution == ConflictResolution::KeepLocal {
                return Ok(ApplyOutcome::Conflict(resolution));
            }
            outcome = ApplyOutcome::Conflict(resolution);
        }
    }

    let timestamp = clock.tick()?;
    let expected = local.as_ref().map(|t| t.timestamp);
    match table
        .write()
        .write_remote(&key, row, view, expected, timestamp, ctx.sender)?
    {
        RemoteWrite::Written => Ok(outcome),
        RemoteWrite::Stale => {
            tracing::debug!(table = %view.name, key = %key, "row modified concurrently, skipped");
            Ok(ApplyOutcome::ConcurrentlyModified)
        }
    }
}

/// Per-table counters for applied changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChangesApplied {
    /// Table name.
    pub table: String,
    /// Modified rows written.
    pub upserts: u64,
    /// Tombstones written.
    pub deletes: u64,
    /// Conflicts detected.
    pub conflicts: u64,
    /// Conflicts where the incoming row was written.
    pub resolved_remote: u64,
    /// Rows skipped because of a concurrent write.
    pub concurrently_modified: u64,
    /// Rows that could not be written.
    pub failed: u64,
}

impl TableChangesApplied {
    /// Rows written, conflicts resolved in the sender's favour included.
    pub fn applied(&self) -> u64 {
        self.upserts + self.deletes
    }
}

/// Counters for one apply pass across tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyStats {
    /// Per-table counters in first-seen order.
    pub tables: Vec<TableChangesApplied>,
}

impl ApplyStats {
    /// Returns the counters for `table`, creating them if needed.
    pub fn table_mut(&mut self, table: &str) -> &mut TableChangesApplied {
        let index = match self.tables.iter().position(|t| t.table == table) {
            Some(index) => index,
            None => {
                self.tables.push(TableChangesApplied {
                    table: table.to_string(),
                    ..Default::default()
                });
                self.tables.len() - 1
            }
        };
        &mut self.tables[index]
    }

    /// Records the outcome for one row.
    pub fn record(&mut self, table: &str, row: &SyncRow, outcome: &CoreResult<ApplyOutcome>) {
        let entry = self.table_mut(table);
        let written = match outcome {
            Ok(ApplyOutcome::Applied) => true,
            Ok(ApplyOutcome::Conflict(ConflictResolution::AcceptRemote)) => {
                entry.conflicts += 1;
                entry.resolved_remote += 1;
                true
            }
            Ok(ApplyOutcome::Conflict(ConflictResolution::KeepLocal)) => {
                entry.conflicts += 1;
                false
            }
            Ok(ApplyOutcome::ConcurrentlyModified) => {
                entry.concurrently_modified += 1;
                false
            }
            Err(_) => {
                entry.failed += 1;
                false
            }
        };
        if written {
            if row.is_tombstone() {
                entry.deletes += 1;
            } else {
                entry.upserts += 1;
            }
        }
    }

    /// Adds another pass's counters into this one.
    pub fn merge(&mut self, other: &ApplyStats) {
        for theirs in &other.tables {
            let ours = self.table_mut(&theirs.table);
            ours.upserts += theirs.upserts;
            ours.deletes += theirs.deletes;
            ours.conflicts += theirs.conflicts;
            ours.resolved_remote += theirs.resolved_remote;
            ours.concurrently_modified += theirs.concurrently_modified;
            ours.failed += theirs.failed;
        }
    }

    /// Total rows written.
    pub fn total_applied(&self) -> u64 {
        self.tables.iter().map(TableChangesApplied::applied).sum()
    }

    /// Total conflicts.
    pub fn total_conflicts(&self) -> u64 {
        self.tables.iter().map(|t| t.conflicts).sum()
    }

    /// Total failed rows.
    pub fn total_failed(&self) -> u64 {
        self.tables.iter().map(|t| t.failed).sum()
    }
}
