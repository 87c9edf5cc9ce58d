//! Property-based test generators using proptest.
//!
//! Keys are drawn from small ranges so that generated write sequences
//! overwrite and delete the same rows often.

use crate::fixtures::{item_key, item_with_qty, note, note_key, ITEMS, NOTES};
use proptest::prelude::*;
use scopesync_core::{CoreResult, Replica, Value};

/// Owners used for `notes` keys.
pub const OWNERS: [&str; 3] = ["ann", "bob", "cy"];

/// One local write against the test schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalWrite {
    /// Insert or replace an `items` row.
    UpsertItem {
        /// Key.
        id: i64,
        /// Name column.
        name: String,
        /// Quantity column.
        qty: i64,
    },
    /// Delete an `items` row.
    DeleteItem {
        /// Key.
        id: i64,
    },
    /// Insert or replace a `notes` row.
    UpsertNote {
        /// First key column.
        owner: &'static str,
        /// Second key column.
        seq: i64,
        /// Body column.
        body: String,
    },
    /// Delete a `notes` row.
    DeleteNote {
        /// First key column.
        owner: &'static str,
        /// Second key column.
        seq: i64,
    },
}

impl LocalWrite {
    /// Applies the write to `replica` as a local change.
    ///
    /// # Errors
    ///
    /// Returns the replica's error; deleting a missing row is not an error.
    pub fn apply(&self, replica: &Replica) -> CoreResult<()> {
        match self {
            LocalWrite::UpsertItem { id, name, qty } => {
                replica.upsert(ITEMS, item_with_qty(*id, name, *qty))?;
            }
            LocalWrite::DeleteItem { id } => {
                replica.delete(ITEMS, &item_key(*id))?;
            }
            LocalWrite::UpsertNote { owner, seq, body } => {
                replica.upsert(NOTES, note(owner, *seq, body))?;
            }
            LocalWrite::DeleteNote { owner, seq } => {
                replica.delete(NOTES, &note_key(owner, *seq))?;
            }
        }
        Ok(())
    }
}

/// Applies every write in order.
///
/// # Errors
///
/// Returns the first failing write's error.
pub fn apply_writes(replica: &Replica, writes: &[LocalWrite]) -> CoreResult<()> {
    writes.iter().try_for_each(|w| w.apply(replica))
}

/// Strategy for short text values.
pub fn text_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for cell values of any type.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        (-1.0e6f64..1.0e6).prop_map(Value::Real),
        text_strategy().prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ]
}

/// Strategy for one write with keys below `max_key`.
pub fn local_write_strategy(max_key: i64) -> impl Strategy<Value = LocalWrite> {
    let max_key = max_key.max(1);
    let owner = prop::sample::select(OWNERS.to_vec());
    prop_oneof![
        3 => (0..max_key, text_strategy(), 0i64..100)
            .prop_map(|(id, name, qty)| LocalWrite::UpsertItem { id, name, qty }),
        1 => (0..max_key).prop_map(|id| LocalWrite::DeleteItem { id }),
        2 => (owner.clone(), 0..max_key, text_strategy())
            .prop_map(|(owner, seq, body)| LocalWrite::UpsertNote { owner, seq, body }),
        1 => (owner, 0..max_key).prop_map(|(owner, seq)| LocalWrite::DeleteNote { owner, seq }),
    ]
}

/// Strategy for up to `max_len` writes with keys below `max_key`.
pub fn local_writes_strategy(
    max_key: i64,
    max_len: usize,
) -> impl Strategy<Value = Vec<LocalWrite>> {
    prop::collection::vec(local_write_strategy(max_key), 0..=max_len)
}
