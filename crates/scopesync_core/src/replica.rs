//! The replica: tracked tables, clock, scopes and staging behind one handle.

use crate::applier::{apply_row, ApplyContext, ApplyStats};
use crate::batch::{create_parts, BatchInfo, BatchPart};
use crate::change::{Change, RowState, SyncRow};
use crate::clock::LogicalClock;
use crate::config::ReplicaConfig;
use crate::error::{CoreError, CoreResult};
use crate::schema::{SyncSchema, TableDescriptor};
use crate::scope::ScopeStore;
use crate::tracking::{TrackedTable, TrackingRow};
use crate::types::ScopeId;
use crate::value::{PrimaryKey, Row};
use parking_lot::RwLock;
use scopesync_storage::{InMemoryBackend, StorageBackend};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Storage key holding the replica id.
const REPLICA_ID_KEY: &str = "replica/id";

type SharedTable = Arc<RwLock<TrackedTable>>;

/// One side of a synchronization: a client database or the server.
///
/// Every row mutation goes through a single table lock for one row; no lock
/// spans a batch, so a batch can be partially applied and safely redone.
pub struct Replica {
    id: ScopeId,
    config: ReplicaConfig,
    backend: Arc<dyn StorageBackend>,
    clock: LogicalClock,
    tables: RwLock<BTreeMap<String, SharedTable>>,
    scopes: ScopeStore,
}

impl Replica {
    /// Opens a replica over `backend`, restoring its id and clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted id or clock cannot be read.
    pub fn open(backend: Arc<dyn StorageBackend>, config: ReplicaConfig) -> CoreResult<Self> {
        let id = match backend.read(REPLICA_ID_KEY)? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map(ScopeId::from_uuid)
                .map_err(|e| CoreError::codec(format!("replica id: {e}")))?,
            None => {
                let id = ScopeId::new();
                backend.write(REPLICA_ID_KEY, id.as_uuid().as_bytes())?;
                backend.sync()?;
                id
            }
        };
        let clock = LogicalClock::open(Arc::clone(&backend), config.clock_window)?;
        tracing::info!(replica = %config.name, %id, "opened replica");
        Ok(Self {
            id,
            config,
            backend,
            clock,
            tables: RwLock::new(BTreeMap::new()),
            scopes: ScopeStore::new(),
        })
    }

    /// Opens a replica with in-memory storage.
    ///
    /// # Errors
    ///
    /// Never fails in practice; kept fallible to match [`Replica::open`].
    pub fn in_memory(config: ReplicaConfig) -> CoreResult<Self> {
        Self::open(Arc::new(InMemoryBackend::new()), config)
    }

    /// The replica's scope id.
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// The replica's name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration.
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    /// The storage backend used for clock state and staging.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Scope records.
    pub fn scopes(&self) -> &ScopeStore {
        &self.scopes
    }

    /// Issues a fresh local logical timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error if the clock reservation cannot be persisted.
    pub fn local_timestamp(&self) -> CoreResult<u64> {
        self.clock.tick()
    }

    /// The last issued timestamp, without advancing the clock.
    pub fn current_timestamp(&self) -> u64 {
        self.clock.current()
    }

    fn table(&self, name: &str) -> CoreResult<SharedTable> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::schema_missing(format!("table {name}")))
    }

    /// Creates an unprovisioned table. Creating an identical table again is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` for malformed descriptors and `SchemaMismatch`
    /// if a different table with the same name exists.
    pub fn create_table(&self, descriptor: TableDescriptor) -> CoreResult<()> {
        descriptor.validate()?;
        let mut tables = self.tables.write();
        if let Some(existing) = tables.get(&descriptor.name) {
            if existing.read().descriptor() != &descriptor {
                return Err(CoreError::schema_mismatch(
                    &descriptor.name,
                    "table exists with a different definition",
                ));
            }
            return Ok(());
        }
        tables.insert(
            descriptor.name.clone(),
            Arc::new(RwLock::new(TrackedTable::new(descriptor))),
        );
        Ok(())
    }

    /// Full schema of every table, in name order.
    pub fn schema(&self) -> SyncSchema {
        SyncSchema::new(
            self.tables
                .read()
                .values()
                .map(|t| t.read().descriptor().clone())
                .collect(),
        )
    }

    /// Creates missing tables of `schema` and provisions tracking for all of
    /// them. Returns the number of existing rows back-filled with tracking.
    ///
    /// # Errors
    ///
    /// Returns a schema error if an existing table cannot serve `schema`.
    pub fn provision(&self, schema: &SyncSchema) -> CoreResult<usize> {
        schema.validate()?;
        for view in &schema.tables {
            if self.tables.read().get(&view.name).is_none() {
                self.create_table(view.clone())?;
            }
        }
        self.schema().check_views(schema)?;

        let mut filled = 0;
        for view in &schema.tables {
            let table = self.table(&view.name)?;
            filled += table.write().provision(&self.clock)?;
        }
        tracing::info!(
            replica = %self.config.name,
            tables = schema.tables.len(),
            filled,
            "provisioned tracking"
        );
        Ok(filled)
    }

    /// Drops tracking for the tables of `schema`. Data rows are kept.
    pub fn deprovision(&self, schema: &SyncSchema) {
        for view in &schema.tables {
            if let Ok(table) = self.table(&view.name) {
                table.write().deprovision();
            }
        }
        tracing::info!(replica = %self.config.name, "deprovisioned tracking");
    }

    /// Inserts or replaces a row as a local write.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` for unknown tables and `InvalidRow` for rows
    /// that do not fit.
    pub fn upsert(&self, table: &str, row: Row) -> CoreResult<PrimaryKey> {
        self.table(table)?.write().upsert_local(row, &self.clock)
    }

    /// Deletes a row as a local write. Returns false if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` for unknown tables.
    pub fn delete(&self, table: &str, key: &PrimaryKey) -> CoreResult<bool> {
        self.table(table)?.write().delete_local(key, &self.clock)
    }

    /// Reads a data row.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` for unknown tables.
    pub fn get(&self, table: &str, key: &PrimaryKey) -> CoreResult<Option<Row>> {
        Ok(self.table(table)?.read().get(key).cloned())
    }

    /// Reads a tracking row.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` for unknown or unprovisioned tables.
    pub fn tracking_row(&self, table: &str, key: &PrimaryKey) -> CoreResult<Option<TrackingRow>> {
        Ok(self.table(table)?.read().tracking_row(key)?.cloned())
    }

    /// Number of data rows in `table`.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` for unknown tables.
    pub fn row_count(&self, table: &str) -> CoreResult<usize> {
        Ok(self.table(table)?.read().row_count())
    }

    fn provisioned_views(
        &self,
        schema: &SyncSchema,
    ) -> CoreResult<Vec<(SharedTable, TableDescriptor)>> {
        schema
            .tables
            .iter()
            .map(|view| {
                let table = self.table(&view.name)?;
                if !table.read().is_provisioned() {
                    return Err(CoreError::schema_missing(format!(
                        "tracking table for {}",
                        view.name
                    )));
                }
                Ok((table, view.clone()))
            })
            .collect()
    }

    /// Selects rows changed after `since`, excluding rows last written by
    /// `requesting`.
    ///
    /// The selection is lazy and restartable; tables are visited in schema
    /// order and rows in key order.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` if a table or its tracking is absent.
    pub fn select_changes(
        &self,
        schema: &SyncSchema,
        since: u64,
        requesting: ScopeId,
    ) -> CoreResult<ChangeSelection> {
        Ok(ChangeSelection {
            tables: self.provisioned_views(schema)?,
            filter: Some((since, requesting)),
            position: 0,
            after: None,
        })
    }

    /// Selects every data row of `schema`, ignoring tracking.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` for unknown tables.
    pub fn select_all_rows(&self, schema: &SyncSchema) -> CoreResult<ChangeSelection> {
        let tables = schema
            .tables
            .iter()
            .map(|view| Ok((self.table(&view.name)?, view.clone())))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(ChangeSelection {
            tables,
            filter: None,
            position: 0,
            after: None,
        })
    }

    /// Counts the changes `select_changes` would return.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` if a table or its tracking is absent.
    pub fn estimate_changes(
        &self,
        schema: &SyncSchema,
        since: u64,
        requesting: ScopeId,
    ) -> CoreResult<u64> {
        let mut total = 0;
        for (table, _) in self.provisioned_views(schema)? {
            total += table.read().count_changes(since, requesting)? as u64;
        }
        Ok(total)
    }

    /// Creates an empty batch, staged or resident per configuration.
    pub fn new_batch(&self, timestamp: u64) -> BatchInfo {
        if self.config.stage_batches {
            BatchInfo::staged(Arc::clone(&self.backend), timestamp)
        } else {
            BatchInfo::resident(timestamp)
        }
    }

    /// Drains `selection` into a new batch stamped with `timestamp`.
    ///
    /// # Errors
    ///
    /// Returns the first selection, storage or codec error. Partially staged
    /// parts are removed.
    pub fn build_batch(
        &self,
        selection: ChangeSelection,
        max_rows_per_part: usize,
        timestamp: u64,
    ) -> CoreResult<BatchInfo> {
        let mut failure = None;
        let changes = selection.map_while(|item| match item {
            Ok(change) => Some(change),
            Err(e) => {
                failure = Some(e);
                None
            }
        });
        let mut batch = create_parts(changes, max_rows_per_part, self.new_batch(timestamp))?;
        if let Some(e) = failure {
            batch.clear()?;
            return Err(e);
        }
        Ok(batch)
    }

    /// Applies one part. Row failures are counted in `stats`, not returned.
    ///
    /// # Errors
    ///
    /// Returns a schema error if the part's table is not part of `schema` or
    /// not provisioned; such errors abort the whole apply.
    pub fn apply_part(
        &self,
        schema: &SyncSchema,
        part: &BatchPart,
        ctx: &ApplyContext<'_>,
        stats: &mut ApplyStats,
    ) -> CoreResult<()> {
        if part.rows.is_empty() {
            return Ok(());
        }
        let view = schema
            .table(&part.table)
            .ok_or_else(|| {
                CoreError::schema_missing(format!("table {} not in scope", part.table))
            })?;
        let table = self.table(&part.table)?;
        for row in &part.rows {
            let outcome = apply_row(&table, view, row, &self.clock, ctx);
            if matches!(&outcome, Err(e) if e.is_schema_error()) {
                return outcome.map(|_| ());
            }
            if let Err(e) = &outcome {
                tracing::warn!(table = %part.table, error = %e, "row apply failed");
            }
            stats.record(&part.table, row, &outcome);
        }
        Ok(())
    }

    /// Applies every part of a complete batch in index order.
    ///
    /// # Errors
    ///
    /// Returns schema errors and errors loading staged parts; per-row
    /// failures are only counted.
    pub fn apply_batch(
        &self,
        schema: &SyncSchema,
        batch: &BatchInfo,
        ctx: &ApplyContext<'_>,
    ) -> CoreResult<ApplyStats> {
        if !batch.is_complete() {
            return Err(CoreError::invalid_operation(format!(
                "batch {} is incomplete",
                batch.id()
            )));
        }
        let mut stats = ApplyStats::default();
        for index in 0..batch.part_count() {
            let part = batch.part(index)?;
            self.apply_part(schema, &part, ctx, &mut stats)?;
        }
        tracing::debug!(
            replica = %self.config.name,
            batch_id = batch.id(),
            applied = stats.total_applied(),
            conflicts = stats.total_conflicts(),
            failed = stats.total_failed(),
            "applied batch"
        );
        Ok(stats)
    }

    /// Purges tombstone tracking rows with `timestamp <= older_than` from
    /// the tables of `schema`. Returns the number purged.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` for unknown tables.
    pub fn delete_metadata(&self, schema: &SyncSchema, older_than: u64) -> CoreResult<usize> {
        let mut purged = 0;
        for view in &schema.tables {
            purged += self.table(&view.name)?.write().delete_metadata(older_than);
        }
        tracing::info!(replica = %self.config.name, older_than, purged, "deleted metadata");
        Ok(purged)
    }

    /// Removes all data and tracking rows of the tables of `schema`.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMissing` for unknown tables.
    pub fn reset_tables(&self, schema: &SyncSchema) -> CoreResult<()> {
        for view in &schema.tables {
            self.table(&view.name)?.write().clear();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("clock", &self.clock)
            .field("tables", &self.tables.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A lazy, restartable walk over selected rows.
///
/// Each step takes the table lock only long enough to find the next row
/// after the last key returned. Re-enumerating over unchanged tables yields
/// the same rows in the same order.
pub struct ChangeSelection {
    tables: Vec<(SharedTable, TableDescriptor)>,
    filter: Option<(u64, ScopeId)>,
    position: usize,
    after: Option<PrimaryKey>,
}

impl ChangeSelection {
    /// Rewinds to the first row.
    pub fn restart(&mut self) {
        self.position = 0;
        self.after = None;
    }
}

impl Iterator for ChangeSelection {
    type Item = CoreResult<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (table, view) = self.tables.get(self.position)?;
            let guard = table.read();
            let found = match self.filter {
                Some((since, requesting)) => {
                    guard.next_change(self.after.as_ref(), since, requesting, view)
                }
                None => Ok(guard.next_row(self.after.as_ref(), view).map(|(key, values)| {
                    let tracking = guard.tracking_row(&key).ok().flatten();
                    let row = SyncRow {
                        values,
                        state: RowState::Modified,
                        timestamp: tracking.map_or(0, |t| t.timestamp),
                        update_scope_id: tracking.and_then(|t| t.update_scope_id),
                    };
                    (key, row)
                })),
            };
            match found {
                Ok(Some((key, row))) => {
                    self.after = Some(key);
                    return Some(Ok(Change::new(view.name.clone(), row)));
                }
                Ok(None) => {
                    drop(guard);
                    self.position += 1;
                    self.after = None;
                }
                Err(e) => {
                    drop(guard);
                    self.position = self.tables.len();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl std::fmt::Debug for ChangeSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSelection")
            .field("tables", &self.tables.len())
            .field("filter", &self.filter)
            .field("position", &self.position)
            .finish()
    }
}
