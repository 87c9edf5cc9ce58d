//! Batch transfer: splitting a changeset into ordered parts and reassembling
//! them on the receiving side.
//!
//! Parts are consumed in strictly increasing index order. The receiver
//! accepts a repeat of the last accepted index as a retransmit and rejects
//! any other out-of-sequence index.

use crate::change::{Change, SyncRow};
use crate::error::{CoreError, CoreResult};
use scopesync_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Key prefix under which staged parts live.
pub const STAGING_PREFIX: &str = "batch";

/// Rows of one table chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPart {
    /// Position within the batch, from zero.
    pub index: u32,
    /// Table every row belongs to.
    pub table: String,
    /// Rows in selection order.
    pub rows: Vec<SyncRow>,
    /// Set on the final part only.
    pub is_last: bool,
}

/// Metadata of a part, kept even when rows are staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPartInfo {
    /// Position within the batch.
    pub index: u32,
    /// Table name.
    pub table: String,
    /// Number of rows in the part.
    pub row_count: u32,
    /// How many of those rows are tombstones.
    pub tombstones: u32,
    /// Set on the final part only.
    pub is_last: bool,
}

impl From<&BatchPart> for BatchPartInfo {
    fn from(part: &BatchPart) -> Self {
        Self {
            index: part.index,
            table: part.table.clone(),
            row_count: part.rows.len() as u32,
            tombstones: part.rows.iter().filter(|r| r.is_tombstone()).count() as u32,
            is_last: part.is_last,
        }
    }
}

/// Rows of one table in a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableChangesSelected {
    /// Table name.
    pub table: String,
    /// Rows carrying data.
    pub upserts: u64,
    /// Tombstones.
    pub deletes: u64,
}

/// Resident parts are shared between clones; cloning a batch never copies
/// rows.
#[derive(Clone)]
enum PartStore {
    Resident(Vec<Arc<BatchPart>>),
    Staged(Arc<dyn StorageBackend>),
}

/// An ordered changeset split into parts.
///
/// Clones share part data. Clearing a staged batch removes its parts for
/// every clone; clearing a resident one only forgets them in that clone.
#[derive(Clone)]
pub struct BatchInfo {
    id: String,
    timestamp: u64,
    parts: Vec<BatchPartInfo>,
    store: PartStore,
}

impl BatchInfo {
    /// Creates an empty batch kept in memory.
    pub fn resident(timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            parts: Vec::new(),
            store: PartStore::Resident(Vec::new()),
        }
    }

    /// Creates an empty batch whose rows are staged in `backend`.
    pub fn staged(backend: Arc<dyn StorageBackend>, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            parts: Vec::new(),
            store: PartStore::Staged(backend),
        }
    }

    /// Batch identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Logical timestamp the batch was selected at.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Part metadata in index order.
    pub fn parts(&self) -> &[BatchPartInfo] {
        &self.parts
    }

    /// Number of parts.
    pub fn part_count(&self) -> u32 {
        self.parts.len() as u32
    }

    /// Total rows across parts.
    pub fn row_count(&self) -> u64 {
        self.parts.iter().map(|p| u64::from(p.row_count)).sum()
    }

    /// Per-table row counts, in the order tables first appear. Read from
    /// part metadata; staged rows are not loaded.
    pub fn selected(&self) -> Vec<TableChangesSelected> {
        let mut tables: Vec<TableChangesSelected> = Vec::new();
        for part in &self.parts {
            let index = match tables.iter().position(|t| t.table == part.table) {
                Some(index) => index,
                None => {
                    tables.push(TableChangesSelected {
                        table: part.table.clone(),
                        ..Default::default()
                    });
                    tables.len() - 1
                }
            };
            let deletes = u64::from(part.tombstones);
            tables[index].deletes += deletes;
            tables[index].upserts += u64::from(part.row_count) - deletes;
        }
        tables
    }

    /// Returns true if rows are staged to storage.
    pub fn is_staged(&self) -> bool {
        matches!(self.store, PartStore::Staged(_))
    }

    /// Returns true once the last part is present. A batch with no parts is
    /// complete.
    pub fn is_complete(&self) -> bool {
        self.parts.last().map_or(true, |p| p.is_last)
    }

    /// Storage key of a staged part.
    pub fn staging_key(batch_id: &str, index: u32) -> String {
        format!("{STAGING_PREFIX}/{batch_id}/{index:08}")
    }

    fn push(&mut self, part: BatchPart) -> CoreResult<()> {
        let info = BatchPartInfo::from(&part);
        match &mut self.store {
            PartStore::Resident(parts) => parts.push(Arc::new(part)),
            PartStore::Staged(backend) => {
                let mut bytes = Vec::new();
                ciborium::into_writer(&part, &mut bytes)
                    .map_err(|e| CoreError::codec(e.to_string()))?;
                backend.write(&Self::staging_key(&self.id, part.index), &bytes)?;
            }
        }
        self.parts.push(info);
        Ok(())
    }

    /// Loads part `index`.
    ///
    /// # Errors
    ///
    /// Returns `BatchPartNotFound` for unknown indices and storage or codec
    /// errors for staged parts.
    pub fn part(&self, index: u32) -> CoreResult<BatchPart> {
        let not_found = || CoreError::BatchPartNotFound {
            batch_id: self.id.clone(),
            index,
        };
        match &self.store {
            PartStore::Resident(parts) => parts
                .get(index as usize)
                .map(|part| BatchPart::clone(part))
                .ok_or_else(not_found),
            PartStore::Staged(backend) => {
                if index as usize >= self.parts.len() {
                    return Err(not_found());
                }
                let bytes = backend
                    .read(&Self::staging_key(&self.id, index))?
                    .ok_or_else(not_found)?;
                ciborium::from_reader(bytes.as_slice())
                    .map_err(|e| CoreError::codec(e.to_string()))
            }
        }
    }

    /// Removes staged artifacts and forgets all parts.
    ///
    /// # Errors
    ///
    /// Returns an error if staged parts cannot be removed.
    pub fn clear(&mut self) -> CoreResult<()> {
        match &mut self.store {
            PartStore::Resident(parts) => parts.clear(),
            PartStore::Staged(backend) => {
                let removed = backend.remove_prefix(&format!("{STAGING_PREFIX}/{}/", self.id))?;
                tracing::debug!(batch_id = %self.id, removed, "cleared staged batch");
            }
        }
        self.parts.clear();
        Ok(())
    }
}

impl std::fmt::Debug for BatchInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchInfo")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("parts", &self.parts.len())
            .field("staged", &self.is_staged())
            .finish()
    }
}

/// Splits `changes` into parts of at most `max_rows_per_part` rows, one
/// table per part, appending them to `batch`.
///
/// A row is never split across parts. When `changes` is empty the batch
/// stays empty and is complete.
///
/// # Errors
///
/// Returns storage or codec errors from staging.
pub fn create_parts<I>(
    changes: I,
    max_rows_per_part: usize,
    mut batch: BatchInfo,
) -> CoreResult<BatchInfo>
where
    I: IntoIterator<Item = Change>,
{
    let max_rows = max_rows_per_part.max(1);
    let mut pending: Option<BatchPart> = None;

    for change in changes {
        let starts_new = match &pending {
            Some(part) => part.table != change.table || part.rows.len() >= max_rows,
            None => true,
        };
        if starts_new {
            if let Some(full) = pending.take() {
                batch.push(full)?;
            }
            pending = Some(BatchPart {
                index: batch.part_count(),
                table: change.table,
                rows: Vec::with_capacity(max_rows),
                is_last: false,
            });
        }
        if let Some(part) = pending.as_mut() {
            part.rows.push(change.row);
        }
    }

    if let Some(mut last) = pending {
        last.is_last = true;
        batch.push(last)?;
    }
    tracing::debug!(
        batch_id = %batch.id,
        parts = batch.part_count(),
        rows = batch.row_count(),
        "created batch"
    );
    Ok(batch)
}

/// Result of receiving one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The part was appended.
    Accepted,
    /// The part repeats the last accepted index and was ignored.
    Duplicate,
}

/// Reassembles parts sent by the other side.
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    batch: BatchInfo,
}

impl BatchAssembler {
    /// Starts assembling into `batch`, which must be empty.
    pub fn new(batch: BatchInfo) -> Self {
        Self { batch }
    }

    /// Index the next new part must carry.
    pub fn expected_index(&self) -> u32 {
        self.batch.part_count()
    }

    /// Returns true once the last part has arrived.
    pub fn is_complete(&self) -> bool {
        !self.batch.parts.is_empty() && self.batch.is_complete()
    }

    /// Appends `part`.
    ///
    /// # Errors
    ///
    /// Returns `BatchAlreadyComplete` for new parts after the last one and
    /// `OutOfOrderBatchPart` for any index other than the expected one or a
    /// repeat of the last accepted one.
    pub fn receive(&mut self, part: BatchPart) -> CoreResult<ReceiveOutcome> {
        let expected = self.expected_index();
        if expected > 0 && part.index == expected - 1 {
            tracing::debug!(batch_id = %self.batch.id, index = part.index, "duplicate batch part");
            return Ok(ReceiveOutcome::Duplicate);
        }
        if self.is_complete() {
            return Err(CoreError::BatchAlreadyComplete {
                batch_id: self.batch.id.clone(),
                index: part.index,
            });
        }
        if part.index != expected {
            return Err(CoreError::OutOfOrderBatchPart {
                expected,
                actual: part.index,
            });
        }
        self.batch.push(part)?;
        Ok(ReceiveOutcome::Accepted)
    }

    /// Returns the batch assembled so far.
    pub fn batch(&self) -> &BatchInfo {
        &self.batch
    }

    /// Consumes the assembler.
    pub fn into_batch(self) -> BatchInfo {
        self.batch
    }
}

/// A staged part found in a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPart {
    /// Owning batch.
    pub batch_id: String,
    /// Part metadata.
    pub info: BatchPartInfo,
}

/// Lists every staged part in `backend`, ordered by batch and index.
///
/// # Errors
///
/// Returns storage or codec errors.
pub fn list_staged(backend: &dyn StorageBackend) -> CoreResult<Vec<StagedPart>> {
    let mut found = Vec::new();
    for key in backend.keys(&format!("{STAGING_PREFIX}/"))? {
        let Some(bytes) = backend.read(&key)? else {
            continue;
        };
        let part: BatchPart =
            ciborium::from_reader(bytes.as_slice()).map_err(|e| CoreError::codec(e.to_string()))?;
        let batch_id = key
            .split('/')
            .nth(1)
            .unwrap_or_default()
            .to_string();
        found.push(StagedPart {
            batch_id,
            info: BatchPartInfo::from(&part),
        });
    }
    Ok(found)
}
