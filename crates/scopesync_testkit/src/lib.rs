//! # scopesync Testkit
//!
//! Test utilities for scopesync.
//!
//! This crate provides:
//! - A canonical two-table schema and row builders
//! - Replica fixtures over memory or a temporary directory
//! - Property-based generators for local write sequences
//! - Helpers comparing table contents across replicas
//!
//! ## Usage
//!
//! ```rust,ignore
//! use scopesync_testkit::prelude::*;
//!
//! #[test]
//! fn converges() {
//!     let server = TestReplica::memory("server");
//!     let client = TestReplica::memory("client");
//!     client.upsert(ITEMS, item(1, "pen")).unwrap();
//!     // ... synchronize
//!     assert_converged(&server, &client, &[ITEMS, NOTES]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod inspect;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::inspect::*;
}

pub use fixtures::*;
pub use generators::*;
pub use inspect::*;
