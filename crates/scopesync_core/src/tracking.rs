//! Tracked tables: data rows shadowed by tracking rows.

use crate::change::{RowState, SyncRow};
use crate::clock::LogicalClock;
use crate::error::{CoreError, CoreResult};
use crate::schema::TableDescriptor;
use crate::types::{now_millis, ScopeId};
use crate::value::{PrimaryKey, Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Change metadata for one data row.
///
/// A tracking row outlives its data row: deleting the data row turns the
/// tracking row into a tombstone, which stays until metadata retention
/// removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRow {
    /// Mirrored primary key.
    pub key: PrimaryKey,
    /// Scope that last wrote the row; `None` for local writes.
    pub update_scope_id: Option<ScopeId>,
    /// Logical clock value of the last write.
    pub timestamp: u64,
    /// Whether the data row is deleted.
    pub sync_row_is_tombstone: bool,
    /// Wall-clock milliseconds of the last write. Informational.
    pub last_change_datetime: u64,
}

impl TrackingRow {
    /// Returns true if this row is part of `SelectChanges(since, requesting)`.
    ///
    /// Rows last written by `requesting` are excluded so a replica never
    /// receives back what it pushed.
    pub fn is_selected(&self, since: u64, requesting: ScopeId) -> bool {
        self.timestamp > since
            && (self.update_scope_id.is_none() || self.update_scope_id != Some(requesting))
    }
}

/// Result of a compare-and-write of a remote row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteWrite {
    /// The row was written.
    Written,
    /// The tracking row changed since it was read; nothing was written.
    Stale,
}

/// A data table together with its tracking table.
#[derive(Debug, Clone)]
pub struct TrackedTable {
    descriptor: TableDescriptor,
    rows: BTreeMap<PrimaryKey, Row>,
    tracking: Option<BTreeMap<PrimaryKey, TrackingRow>>,
}

impl TrackedTable {
    /// Creates an empty, unprovisioned table.
    pub fn new(descriptor: TableDescriptor) -> Self {
        Self {
            descriptor,
            rows: BTreeMap::new(),
            tracking: None,
        }
    }

    /// Returns the table descriptor.
    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    /// Returns true once tracking exists for this table.
    pub fn is_provisioned(&self) -> bool {
        self.tracking.is_some()
    }

    /// Creates the tracking table and back-fills rows that have none.
    ///
    /// Existing data rows get a tracking row stamped with a fresh clock value
    /// and no owning scope, so they are selected on the next sync. Returns
    /// the number of rows back-filled.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock cannot advance.
    pub fn provision(&mut self, clock: &LogicalClock) -> CoreResult<usize> {
        let tracking = self.tracking.get_or_insert_with(BTreeMap::new);
        let mut filled = 0;
        for key in self.rows.keys() {
            if !tracking.contains_key(key) {
                tracking.insert(
                    key.clone(),
                    TrackingRow {
                        key: key.clone(),
                        update_scope_id: None,
                        timestamp: clock.tick()?,
                        sync_row_is_tombstone: false,
                        last_change_datetime: now_millis(),
                    },
                );
                filled += 1;
            }
        }
        Ok(filled)
    }

    /// Drops the tracking table. Data rows are kept.
    pub fn deprovision(&mut self) {
        self.tracking = None;
    }

    fn tracking(&self) -> CoreResult<&BTreeMap<PrimaryKey, TrackingRow>> {
        self.tracking.as_ref().ok_or_else(|| {
            CoreError::schema_missing(format!("tracking table for {}", self.descriptor.name))
        })
    }

    /// Returns the data row for `key`.
    pub fn get(&self, key: &PrimaryKey) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Returns the tracking row for `key`.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` if the table is not provisioned.
    pub fn tracking_row(&self, key: &PrimaryKey) -> CoreResult<Option<&TrackingRow>> {
        Ok(self.tracking()?.get(key))
    }

    /// Number of data rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Inserts or replaces a row as a local, sync-aware write.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRow` if the row does not fit the table.
    pub fn upsert_local(&mut self, row: Row, clock: &LogicalClock) -> CoreResult<PrimaryKey> {
        self.descriptor.check_row(&row)?;
        let key = self.descriptor.key_of(&row)?;
        if let Some(tracking) = self.tracking.as_mut() {
            tracking.insert(
                key.clone(),
                TrackingRow {
                    key: key.clone(),
                    update_scope_id: None,
                    timestamp: clock.tick()?,
                    sync_row_is_tombstone: false,
                    last_change_datetime: now_millis(),
                },
            );
        }
        self.rows.insert(key.clone(), row);
        Ok(key)
    }

    /// Deletes a row as a local, sync-aware write. Returns false if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock cannot advance.
    pub fn delete_local(&mut self, key: &PrimaryKey, clock: &LogicalClock) -> CoreResult<bool> {
        if self.rows.remove(key).is_none() {
            return Ok(false);
        }
        if let Some(tracking) = self.tracking.as_mut() {
            tracking.insert(
                key.clone(),
                TrackingRow {
                    key: key.clone(),
                    update_scope_id: None,
                    timestamp: clock.tick()?,
                    sync_row_is_tombstone: true,
                    last_change_datetime: now_millis(),
                },
            );
        }
        Ok(true)
    }

    /// Returns the first change strictly after `after` in key order that
    /// `SelectChanges(since, requesting)` includes, projected to `view`.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` if the table is not provisioned.
    pub fn next_change(
        &self,
        after: Option<&PrimaryKey>,
        since: u64,
        requesting: ScopeId,
        view: &TableDescriptor,
    ) -> CoreResult<Option<(PrimaryKey, SyncRow)>> {
        let tracking = self.tracking()?;
        let found = range_after(tracking, after).find(|(_, t)| t.is_selected(since, requesting));
        Ok(found.map(|(key, t)| (key.clone(), self.sync_row(t, view))))
    }

    /// Returns the first data row strictly after `after`, ignoring tracking.
    pub fn next_row(
        &self,
        after: Option<&PrimaryKey>,
        view: &TableDescriptor,
    ) -> Option<(PrimaryKey, Row)> {
        range_after(&self.rows, after)
            .next()
            .map(|(key, row)| (key.clone(), self.project(row, view)))
    }

    /// Counts the rows `SelectChanges(since, requesting)` would return.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` if the table is not provisioned.
    pub fn count_changes(&self, since: u64, requesting: ScopeId) -> CoreResult<usize> {
        Ok(self
            .tracking()?
            .values()
            .filter(|t| t.is_selected(since, requesting))
            .count())
    }

    fn sync_row(&self, tracking: &TrackingRow, view: &TableDescriptor) -> SyncRow {
        let live = if tracking.sync_row_is_tombstone {
            None
        } else {
            self.rows.get(&tracking.key)
        };
        match live {
            Some(row) => SyncRow {
                values: self.project(row, view),
                state: RowState::Modified,
                timestamp: tracking.timestamp,
                update_scope_id: tracking.update_scope_id,
            },
            None => SyncRow {
                values: view.tombstone_row(&tracking.key),
                state: RowState::Tombstone,
                timestamp: tracking.timestamp,
                update_scope_id: tracking.update_scope_id,
            },
        }
    }

    /// Projects a full row onto the columns of `view`.
    fn project(&self, row: &[Value], view: &TableDescriptor) -> Row {
        view.columns
            .iter()
            .map(|c| {
                self.descriptor
                    .columns
                    .iter()
                    .position(|own| own.name == c.name)
                    .and_then(|i| row.get(i).cloned())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Widens a row in `view` columns to a full row, keeping columns outside
    /// the view from `existing`.
    fn widen(&self, incoming: &[Value], view: &TableDescriptor, existing: Option<&Row>) -> Row {
        self.descriptor
            .columns
            .iter()
            .enumerate()
            .map(|(i, own)| {
                view.columns
                    .iter()
                    .position(|c| c.name == own.name)
                    .and_then(|j| incoming.get(j).cloned())
                    .or_else(|| existing.and_then(|row| row.get(i).cloned()))
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Writes a remote row if the tracking row still has `expected_timestamp`.
    ///
    /// `expected_timestamp` is the tracking timestamp observed when the
    /// conflict decision was made, `None` if no tracking row existed. The
    /// tracking row is stamped with `timestamp` and `sender`.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` if unprovisioned and `InvalidRow` if a
    /// modified row does not fit the table.
    pub fn write_remote(
        &mut self,
        key: &PrimaryKey,
        incoming: &SyncRow,
        view: &TableDescriptor,
        expected_timestamp: Option<u64>,
        timestamp: u64,
        sender: ScopeId,
    ) -> CoreResult<RemoteWrite> {
        let current = self.tracking()?.get(key).map(|t| t.timestamp);
        if current != expected_timestamp {
            return Ok(RemoteWrite::Stale);
        }

        let tombstone = incoming.is_tombstone();
        if tombstone {
            self.rows.remove(key);
        } else {
            let row = self.widen(&incoming.values, view, self.rows.get(key));
            self.descriptor.check_row(&row)?;
            self.rows.insert(key.clone(), row);
        }

        let tracking = self.tracking.get_or_insert_with(BTreeMap::new);
        tracking.insert(
            key.clone(),
            TrackingRow {
                key: key.clone(),
                update_scope_id: Some(sender),
                timestamp,
                sync_row_is_tombstone: tombstone,
                last_change_datetime: now_millis(),
            },
        );
        Ok(RemoteWrite::Written)
    }

    /// Removes tombstone tracking rows with `timestamp <= older_than`.
    pub fn delete_metadata(&mut self, older_than: u64) -> usize {
        let Some(tracking) = self.tracking.as_mut() else {
            return 0;
        };
        let before = tracking.len();
        tracking.retain(|_, t| !(t.sync_row_is_tombstone && t.timestamp <= older_than));
        before - tracking.len()
    }

    /// Removes all data and tracking rows, keeping the table provisioned.
    pub fn clear(&mut self) {
        self.rows.clear();
        if let Some(tracking) = self.tracking.as_mut() {
            tracking.clear();
        }
    }
}

fn range_after<'a, V>(
    map: &'a BTreeMap<PrimaryKey, V>,
    after: Option<&PrimaryKey>,
) -> std::collections::btree_map::Range<'a, PrimaryKey, V> {
    match after {
        Some(key) => map.range::<PrimaryKey, _>((Bound::Excluded(key), Bound::Unbounded)),
        None => map.range::<PrimaryKey, _>(..),
    }
}
