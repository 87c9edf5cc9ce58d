//! # scopesync Core
//!
//! Replica data model and the change-tracking core of scopesync.
//!
//! This crate provides:
//! - Logical clock, persisted across restarts
//! - Tracked tables (data rows shadowed by tracking rows and tombstones)
//! - Change selection with echo suppression
//! - The change applier and its conflict rule
//! - Batch parts: splitting, staging and in-order reassembly
//! - Scope records for clients and servers
//!
//! ## Key Invariants
//!
//! - Clock values are strictly increasing per replica, across restarts
//! - A tracking row exists for every row touched by a sync-aware write
//! - Deletes become tombstones until metadata retention purges them
//! - A replica never selects a change last written by the requesting scope
//! - Batch parts are consumed in strictly increasing index order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod batch;
mod change;
mod clock;
mod config;
mod error;
mod replica;
mod schema;
mod scope;
mod tracking;
mod types;
mod value;

pub use applier::{
    apply_row, should_accept, ApplyContext, ApplyOutcome, ApplyRole, ApplyStats, Conflict,
    ConflictPolicy, ConflictResolution, ConflictResolver, TableChangesApplied,
};
pub use batch::{
    create_parts, list_staged, BatchAssembler, BatchInfo, BatchPart, BatchPartInfo,
    ReceiveOutcome, StagedPart, TableChangesSelected, STAGING_PREFIX,
};
pub use change::{Change, RowState, SyncRow};
pub use clock::{LogicalClock, CLOCK_KEY, DEFAULT_CLOCK_WINDOW};
pub use config::ReplicaConfig;
pub use error::{CoreError, CoreResult};
pub use replica::{ChangeSelection, Replica};
pub use schema::{
    ColumnDescriptor, ColumnType, SetupTable, SyncSchema, SyncSetup, TableDescriptor,
};
pub use scope::{ClientScopeInfo, ScopeStore, ServerHistoryScopeInfo, ServerScopeInfo};
pub use tracking::{RemoteWrite, TrackedTable, TrackingRow};
pub use types::{now_millis, ScopeId};
pub use value::{PrimaryKey, Row, Value};

/// Version of the scopesync crates.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
