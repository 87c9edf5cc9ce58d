//! Helpers comparing replica contents.

use scopesync_core::{PrimaryKey, Replica, Row, ScopeId, SyncRow, SyncSchema, TableDescriptor};
use std::collections::BTreeMap;

fn descriptor(replica: &Replica, table: &str) -> TableDescriptor {
    replica
        .schema()
        .table(table)
        .cloned()
        .unwrap_or_else(|| panic!("replica {} has no table {table}", replica.name()))
}

/// Data rows of `table` keyed by primary key.
pub fn table_rows(replica: &Replica, table: &str) -> BTreeMap<PrimaryKey, Row> {
    let descriptor = descriptor(replica, table);
    let schema = SyncSchema::new(vec![descriptor.clone()]);
    replica
        .select_all_rows(&schema)
        .expect("Failed to select rows")
        .map(|change| {
            let row = change.expect("Failed to read row").row.values;
            let key = descriptor.key_of(&row).expect("Row without key");
            (key, row)
        })
        .collect()
}

/// Tracked changes of `table` after `since`, tombstones included.
///
/// The table must be provisioned.
pub fn tracked_changes(replica: &Replica, table: &str, since: u64) -> Vec<SyncRow> {
    let schema = SyncSchema::new(vec![descriptor(replica, table)]);
    replica
        .select_changes(&schema, since, ScopeId::new())
        .expect("Failed to select changes")
        .map(|change| change.expect("Failed to read change").row)
        .collect()
}

/// Number of tombstones tracked for `table`.
pub fn tombstone_count(replica: &Replica, table: &str) -> usize {
    tracked_changes(replica, table, 0)
        .iter()
        .filter(|row| row.is_tombstone())
        .count()
}

/// Asserts that `a` and `b` hold the same rows in every table of `tables`.
pub fn assert_converged(a: &Replica, b: &Replica, tables: &[&str]) {
    for table in tables {
        let left = table_rows(a, table);
        let right = table_rows(b, table);
        assert_eq!(
            left,
            right,
            "table {table} differs between {} and {}",
            a.name(),
            b.name()
        );
    }
}
