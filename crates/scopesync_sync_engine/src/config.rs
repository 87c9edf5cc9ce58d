//! Configuration for the sync agent.

use rand::Rng;
use scopesync_core::ConflictPolicy;
use scopesync_sync_protocol::Serializer;
use std::time::Duration;

/// What to do when the server reports the client scope as outdated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutdatedAction {
    /// Drop local rows of the scope and download everything.
    #[default]
    Reinitialize,
    /// Fail with `SyncError::OutdatedScope`.
    Fail,
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Scope to synchronize.
    pub scope_name: String,
    /// Maximum rows per uploaded part.
    pub max_rows_per_part: usize,
    /// Payload serializer.
    pub serializer: Serializer,
    /// Attach a SHA-256 hash to every request.
    pub hash_payloads: bool,
    /// Policy for conflicts on downloaded rows.
    pub conflict_policy: ConflictPolicy,
    /// Per-request retry behaviour.
    pub retry: RetryConfig,
    /// Reaction to an outdated scope.
    pub on_outdated: OutdatedAction,
    /// Initialize new scopes from the server snapshot when one exists.
    pub use_snapshots: bool,
}

impl SyncConfig {
    /// Creates a configuration for `scope_name`.
    pub fn new(scope_name: impl Into<String>) -> Self {
        Self {
            scope_name: scope_name.into(),
            max_rows_per_part: 500,
            serializer: Serializer::default(),
            hash_payloads: true,
            conflict_policy: ConflictPolicy::default(),
            retry: RetryConfig::default(),
            on_outdated: OutdatedAction::default(),
            use_snapshots: true,
        }
    }

    /// Sets the maximum rows per uploaded part.
    pub fn with_max_rows_per_part(mut self, rows: usize) -> Self {
        self.max_rows_per_part = rows.max(1);
        self
    }

    /// Sets the serializer.
    pub fn with_serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Enables or disables payload hashes.
    pub fn with_payload_hashes(mut self, enabled: bool) -> Self {
        self.hash_payloads = enabled;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the reaction to an outdated scope.
    pub fn with_outdated_action(mut self, action: OutdatedAction) -> Self {
        self.on_outdated = action;
        self
    }

    /// Enables or disables snapshot initialization.
    pub fn with_snapshots(mut self, enabled: bool) -> Self {
        self.use_snapshots = enabled;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Delay before attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay = base.min(self.max_delay.as_secs_f64());
        if self.add_jitter && delay > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=0.25);
            Duration::from_secs_f64(delay * (1.0 + jitter))
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
