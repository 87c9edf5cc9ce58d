//! Protocol steps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The step a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStep {
    /// Fetch the server scope with its full schema.
    EnsureSchema,
    /// Open a session and fetch the server scope summary.
    EnsureScopes,
    /// Upload one client batch part.
    SendChangesInProgress,
    /// Download one server batch part.
    GetMoreChanges,
    /// Report outbound batch progress.
    GetChangesInProgress,
    /// Download one snapshot part.
    GetSnapshot,
    /// Report session counters.
    GetSummary,
    /// Confirm the download finished.
    SendEndDownloadChanges,
    /// Count pending server changes.
    GetEstimatedChangesCount,
    /// Fetch a fresh server timestamp.
    GetRemoteClientTimestamp,
    /// Fetch the operation the server requests.
    GetOperation,
    /// Close the session.
    EndSession,
}

impl SyncStep {
    /// Every step, in code order.
    pub const ALL: [SyncStep; 12] = [
        SyncStep::EnsureSchema,
        SyncStep::EnsureScopes,
        SyncStep::SendChangesInProgress,
        SyncStep::GetMoreChanges,
        SyncStep::GetChangesInProgress,
        SyncStep::GetSnapshot,
        SyncStep::GetSummary,
        SyncStep::SendEndDownloadChanges,
        SyncStep::GetEstimatedChangesCount,
        SyncStep::GetRemoteClientTimestamp,
        SyncStep::GetOperation,
        SyncStep::EndSession,
    ];

    /// Converts to the header code.
    pub fn to_code(self) -> u8 {
        match self {
            SyncStep::EnsureSchema => 1,
            SyncStep::EnsureScopes => 2,
            SyncStep::SendChangesInProgress => 3,
            SyncStep::GetMoreChanges => 4,
            SyncStep::GetChangesInProgress => 5,
            SyncStep::GetSnapshot => 6,
            SyncStep::GetSummary => 7,
            SyncStep::SendEndDownloadChanges => 8,
            SyncStep::GetEstimatedChangesCount => 9,
            SyncStep::GetRemoteClientTimestamp => 10,
            SyncStep::GetOperation => 11,
            SyncStep::EndSession => 12,
        }
    }

    /// Converts from the header code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.to_code() == code)
    }

    /// Returns true if the step may create a session.
    pub fn opens_session(self) -> bool {
        matches!(self, SyncStep::EnsureScopes)
    }

    /// Step name as written in logs.
    pub fn name(self) -> &'static str {
        match self {
            SyncStep::EnsureSchema => "EnsureSchema",
            SyncStep::EnsureScopes => "EnsureScopes",
            SyncStep::SendChangesInProgress => "SendChangesInProgress",
            SyncStep::GetMoreChanges => "GetMoreChanges",
            SyncStep::GetChangesInProgress => "GetChangesInProgress",
            SyncStep::GetSnapshot => "GetSnapshot",
            SyncStep::GetSummary => "GetSummary",
            SyncStep::SendEndDownloadChanges => "SendEndDownloadChanges",
            SyncStep::GetEstimatedChangesCount => "GetEstimatedChangesCount",
            SyncStep::GetRemoteClientTimestamp => "GetRemoteClientTimestamp",
            SyncStep::GetOperation => "GetOperation",
            SyncStep::EndSession => "EndSession",
        }
    }
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
