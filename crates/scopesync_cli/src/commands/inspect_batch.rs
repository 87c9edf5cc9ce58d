//! Inspect-batch command implementation.

use scopesync_core::{list_staged, StagedPart};
use scopesync_storage::DirectoryBackend;
use serde::Serialize;
use std::path::Path;

/// Staged batches found in a replica directory.
#[derive(Debug, Serialize)]
pub struct InspectBatchResult {
    /// Replica directory.
    pub path: String,
    /// Total number of staged parts.
    pub part_count: usize,
    /// Total number of staged rows.
    pub row_count: u64,
    /// Batches in id order.
    pub batches: Vec<BatchSummary>,
}

/// One staged batch.
#[derive(Debug, Serialize)]
pub struct BatchSummary {
    /// Batch id.
    pub id: String,
    /// Parts present, in index order.
    pub parts: Vec<PartSummary>,
    /// Whether the part flagged as last is present.
    pub has_last: bool,
}

/// One staged part.
#[derive(Debug, Serialize)]
pub struct PartSummary {
    /// Index within the batch.
    pub index: u32,
    /// Table of the part's rows.
    pub table: String,
    /// Number of rows.
    pub rows: u32,
    /// Final part of the batch.
    pub is_last: bool,
}

/// Runs the inspect-batch command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects the staged parts under `path`.
///
/// Opening the directory takes its lock, so the owning replica must not be
/// running.
pub fn inspect(path: &Path) -> Result<InspectBatchResult, Box<dyn std::error::Error>> {
    if !path.is_dir() {
        return Err(format!("No replica directory at {}", path.display()).into());
    }

    let backend = DirectoryBackend::open(path)?;
    let staged = list_staged(&backend)?;
    Ok(summarize(path, staged))
}

fn summarize(path: &Path, staged: Vec<StagedPart>) -> InspectBatchResult {
    let part_count = staged.len();
    let row_count = staged.iter().map(|p| u64::from(p.info.row_count)).sum();

    let mut batches: Vec<BatchSummary> = Vec::new();
    for part in staged {
        let summary = PartSummary {
            index: part.info.index,
            table: part.info.table,
            rows: part.info.row_count,
            is_last: part.info.is_last,
        };
        match batches.last_mut() {
            Some(batch) if batch.id == part.batch_id => {
                batch.has_last |= summary.is_last;
                batch.parts.push(summary);
            }
            _ => batches.push(BatchSummary {
                id: part.batch_id,
                has_last: summary.is_last,
                parts: vec![summary],
            }),
        }
    }
    for batch in &mut batches {
        batch.parts.sort_by_key(|p| p.index);
    }

    InspectBatchResult {
        path: path.display().to_string(),
        part_count,
        row_count,
        batches,
    }
}

fn print_text_output(result: &InspectBatchResult) {
    println!("scopesync Staged Batches");
    println!("========================");
    println!();
    println!("Path: {}", result.path);
    println!("Parts: {}", result.part_count);
    println!("Rows:  {}", result.row_count);

    if result.batches.is_empty() {
        println!();
        println!("No staged batches.");
        return;
    }

    for batch in &result.batches {
        println!();
        let state = if batch.has_last { "complete" } else { "partial" };
        println!("Batch {} ({state}):", batch.id);
        for part in &batch.parts {
            println!(
                "  [{}] {} rows of {}{}",
                part.index,
                part.rows,
                part.table,
                if part.is_last { " (last)" } else { "" }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_core::{
        ColumnDescriptor, ColumnType, Replica, ReplicaConfig, SyncSchema, TableDescriptor, Value,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    fn stage_rows(path: &Path, rows: i64, per_part: usize) {
        let backend = Arc::new(DirectoryBackend::open(path).unwrap());
        let mut config = ReplicaConfig::new("staging");
        config.stage_batches = true;
        let replica = Replica::open(backend, config).unwrap();
        let table = TableDescriptor::new(
            "t",
            vec![ColumnDescriptor::new("id", ColumnType::Integer)],
            vec!["id".to_string()],
        );
        replica.create_table(table.clone()).unwrap();
        for id in 0..rows {
            replica.upsert("t", vec![Value::Integer(id)]).unwrap();
        }
        let schema = SyncSchema::new(vec![table]);
        let selection = replica.select_all_rows(&schema).unwrap();
        let ts = replica.local_timestamp().unwrap();
        replica.build_batch(selection, per_part, ts).unwrap();
    }

    #[test]
    fn lists_staged_parts() {
        let temp_dir = TempDir::new().unwrap();
        stage_rows(temp_dir.path(), 5, 2);

        let result = inspect(temp_dir.path()).unwrap();
        assert_eq!(result.part_count, 3);
        assert_eq!(result.row_count, 5);
        assert_eq!(result.batches.len(), 1);

        let batch = &result.batches[0];
        assert!(batch.has_last);
        let indices: Vec<u32> = batch.parts.iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(batch.parts[2].is_last);
    }

    #[test]
    fn empty_directory_has_no_batches() {
        let temp_dir = TempDir::new().unwrap();
        let result = inspect(temp_dir.path()).unwrap();
        assert_eq!(result.part_count, 0);
        assert!(result.batches.is_empty());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(inspect(&temp_dir.path().join("absent")).is_err());
    }
}
