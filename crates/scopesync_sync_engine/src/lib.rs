//! # scopesync Sync Engine
//!
//! Client half of the scopesync protocol.
//!
//! This crate provides:
//! - [`SyncAgent`], which drives one synchronization of a scope
//! - Per-request resend and whole-synchronization restart with exponential
//!   backoff
//! - Transport abstraction over any HTTP client, plus an in-process
//!   loopback client
//! - Result summaries with per-table counters
//!
//! ## Architecture
//!
//! One synchronization is one server session:
//! 1. `EnsureScopes`, `EnsureSchema` and `GetOperation` agree on the scope
//! 2. A server snapshot bootstraps new or reinitialising clients
//! 3. Local changes are uploaded part by part with `SendChangesInProgress`
//! 4. The server's changes are pulled part by part with `GetMoreChanges`
//!    and applied under the conflict rule
//! 5. `EndSession` closes the session; only then are the new timestamps
//!    stored
//!
//! ## Key Invariants
//!
//! - Rows the server sent are never uploaded back
//! - A synchronization either completes or reports its last step
//! - Re-sending a step is always safe

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod agent;
mod config;
mod error;
mod http;
mod transport;

pub use agent::{AgentState, AgentStats, SyncAgent, SyncSummary};
pub use config::{OutdatedAction, RetryConfig, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer};
pub use transport::{MockTransport, SyncTransport};
