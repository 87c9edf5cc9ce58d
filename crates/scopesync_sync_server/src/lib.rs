//! # scopesync Sync Server
//!
//! Server half of the scopesync protocol.
//!
//! This crate provides:
//! - The session state machine and its step dispatch table
//! - An injected session store with sliding expiration
//! - Upload apply, download selection and snapshot serving
//! - Error to status mapping for transports
//!
//! # Architecture
//!
//! The server owns one [`scopesync_core::Replica`] and any number of
//! registered scopes. Each synchronization is a session:
//! 1. `EnsureScopes` opens the session and negotiates scope metadata
//! 2. The client uploads its batch with `SendChangesInProgress`
//! 3. The last part triggers apply and selection of the download
//! 4. The client pulls the download with `GetMoreChanges`
//! 5. `EndSession` records the client's history and drops the session
//!
//! Sessions live in a [`SessionStore`]; a request reads a copy, mutates it
//! and writes it back only on success, so any step can be re-sent after a
//! crash or a cancelled request.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod server;
mod session;
mod session_store;
mod snapshot;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult, GENERIC_INTERNAL_MESSAGE};
pub use handler::{HandlerContext, RequestHandler};
pub use server::{ServerResponse, SyncServer};
pub use session::{Session, SessionState};
pub use session_store::{MemorySessionStore, SessionStore};
pub use snapshot::Snapshot;
