//! Server configuration.

use scopesync_core::ConflictPolicy;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum rows per outbound batch part.
    pub max_rows_per_part: usize,
    /// Sliding session expiration.
    pub session_ttl: Duration,
    /// Interval of the background session reaper.
    pub reaper_interval: Duration,
    /// Include the full error cause chain in error responses.
    pub verbose_errors: bool,
    /// Reject requests without a payload hash.
    pub require_hash: bool,
    /// Policy for conflicts on uploaded rows.
    pub conflict_policy: ConflictPolicy,
}

impl ServerConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            max_rows_per_part: 500,
            session_ttl: Duration::from_secs(600),
            reaper_interval: Duration::from_secs(60),
            verbose_errors: false,
            require_hash: false,
            conflict_policy: ConflictPolicy::ServerWins,
        }
    }

    /// Sets the maximum rows per outbound part.
    pub fn with_max_rows_per_part(mut self, rows: usize) -> Self {
        self.max_rows_per_part = rows.max(1);
        self
    }

    /// Sets the session expiration.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Sets the reaper interval.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Enables verbose error responses.
    pub fn with_verbose_errors(mut self, verbose: bool) -> Self {
        self.verbose_errors = verbose;
        self
    }

    /// Requires a payload hash on every request.
    pub fn with_required_hash(mut self, required: bool) -> Self {
        self.require_hash = required;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
