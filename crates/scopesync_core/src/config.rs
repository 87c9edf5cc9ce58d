//! Replica configuration.

use crate::clock::DEFAULT_CLOCK_WINDOW;

/// Replica configuration.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Human-readable replica name, used in logs.
    pub name: String,
    /// Clock ticks reserved per persisted high-water write.
    pub clock_window: u64,
    /// Stage batch parts to the storage backend instead of memory.
    pub stage_batches: bool,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            name: "replica".into(),
            clock_window: DEFAULT_CLOCK_WINDOW,
            stage_batches: false,
        }
    }
}

impl ReplicaConfig {
    /// Creates a configuration with defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the clock reservation window.
    #[must_use]
    pub fn with_clock_window(mut self, window: u64) -> Self {
        self.clock_window = window.max(1);
        self
    }

    /// Enables or disables staging batch parts to storage.
    #[must_use]
    pub fn with_staged_batches(mut self, enabled: bool) -> Self {
        self.stage_batches = enabled;
        self
    }
}
