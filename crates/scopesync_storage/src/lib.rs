//! # scopesync Storage
//!
//! Keyed blob storage for scopesync.
//!
//! Storage backends are **opaque blob stores**: they map a slash-separated key
//! to a byte string and never interpret what they hold. Higher layers put
//! staged batch parts (`batch/<batch id>/<index>`) and logical clock state
//! (`clock/high_water`) here.
//!
//! ## Design Principles
//!
//! - Backends are simple keyed stores (read, write, remove, list)
//! - No knowledge of batch, change or clock formats
//! - Must be `Send + Sync`; methods take `&self` so one backend can be
//!   shared by every session of a server
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and resident staging
//! - [`DirectoryBackend`] - One file per key under a locked directory
//!
//! ## Example
//!
//! ```rust
//! use scopesync_storage::{StorageBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.write("batch/b1/0", b"part zero").unwrap();
//! assert_eq!(backend.read("batch/b1/0").unwrap(), Some(b"part zero".to_vec()));
//! assert_eq!(backend.keys("batch/b1/").unwrap(), vec!["batch/b1/0".to_string()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod directory;
mod error;
mod key;
mod memory;

pub use backend::StorageBackend;
pub use directory::DirectoryBackend;
pub use error::{StorageError, StorageResult};
pub use key::validate_key;
pub use memory::InMemoryBackend;
