//! Logical clock.
//!
//! Every replica stamps its tracking rows with values from a [`LogicalClock`].
//! The clock never returns a value less than or equal to one it returned
//! before, including across process restarts when it is backed by a
//! [`StorageBackend`].
//!
//! Persistence uses a reservation window: the clock writes a high-water mark
//! `reserved` ahead of the values it hands out, and after a restart resumes
//! strictly above the last persisted mark. At most one storage write happens
//! per `window` ticks.

use crate::error::CoreResult;
use parking_lot::Mutex;
use scopesync_storage::StorageBackend;
use std::sync::Arc;

/// Storage key holding the persisted high-water mark.
pub const CLOCK_KEY: &str = "clock/high_water";

/// Default number of ticks reserved per persisted write.
pub const DEFAULT_CLOCK_WINDOW: u64 = 1024;

struct ClockState {
    last: u64,
    reserved: u64,
}

/// A strictly increasing per-replica counter.
pub struct LogicalClock {
    state: Mutex<ClockState>,
    backend: Option<Arc<dyn StorageBackend>>,
    window: u64,
}

impl LogicalClock {
    /// Creates a volatile clock starting after zero.
    pub fn volatile() -> Self {
        Self {
            state: Mutex::new(ClockState {
                last: 0,
                reserved: u64::MAX,
            }),
            backend: None,
            window: DEFAULT_CLOCK_WINDOW,
        }
    }

    /// Opens a clock persisted in `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted mark cannot be read or is corrupt.
    pub fn open(backend: Arc<dyn StorageBackend>, window: u64) -> CoreResult<Self> {
        let persisted = match backend.read(CLOCK_KEY)? {
            Some(bytes) => decode_mark(&bytes)?,
            None => 0,
        };
        tracing::debug!(high_water = persisted, "opened logical clock");
        Ok(Self {
            state: Mutex::new(ClockState {
                last: persisted,
                reserved: persisted,
            }),
            backend: Some(backend),
            window: window.max(1),
        })
    }

    /// Returns a fresh value, strictly greater than every value returned
    /// before by this clock or any earlier instance over the same backend.
    ///
    /// # Errors
    ///
    /// Returns an error if a new reservation cannot be persisted; no value
    /// is handed out in that case.
    pub fn tick(&self) -> CoreResult<u64> {
        let mut state = self.state.lock();
        let next = state.last + 1;
        if next > state.reserved {
            let reserved = next.saturating_add(self.window);
            self.persist(reserved)?;
            state.reserved = reserved;
        }
        state.last = next;
        Ok(next)
    }

    /// Returns the most recently issued value without advancing.
    pub fn current(&self) -> u64 {
        self.state.lock().last
    }

    fn persist(&self, reserved: u64) -> CoreResult<()> {
        if let Some(backend) = &self.backend {
            backend.write(CLOCK_KEY, &reserved.to_be_bytes())?;
            backend.sync()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LogicalClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LogicalClock")
            .field("last", &state.last)
            .field("reserved", &state.reserved)
            .field("persistent", &self.backend.is_some())
            .finish()
    }
}

fn decode_mark(bytes: &[u8]) -> CoreResult<u64> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| {
        crate::error::CoreError::Storage(scopesync_storage::StorageError::Corrupted(format!(
            "clock mark has {} bytes",
            bytes.len()
        )))
    })?;
    Ok(u64::from_be_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use scopesync_storage::{DirectoryBackend, InMemoryBackend};

    #[test]
    fn volatile_clock_increases() {
        let clock = LogicalClock::volatile();
        let a = clock.tick().unwrap();
        let b = clock.tick().unwrap();
        assert!(b > a);
        assert_eq!(clock.current(), b);
    }

    #[test]
    fn restart_resumes_above_issued_values() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let clock = LogicalClock::open(Arc::clone(&backend), 4).unwrap();
        let mut last = 0;
        for _ in 0..10 {
            last = clock.tick().unwrap();
        }
        drop(clock);

        let reopened = LogicalClock::open(backend, 4).unwrap();
        assert!(reopened.tick().unwrap() > last);
    }

    #[test]
    fn restart_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let last = {
            let backend: Arc<dyn StorageBackend> =
                Arc::new(DirectoryBackend::open(dir.path()).unwrap());
            let clock = LogicalClock::open(backend, 8).unwrap();
            (0..20).map(|_| clock.tick().unwrap()).last().unwrap()
        };
        let backend: Arc<dyn StorageBackend> =
            Arc::new(DirectoryBackend::open(dir.path()).unwrap());
        let clock = LogicalClock::open(backend, 8).unwrap();
        assert!(clock.tick().unwrap() > last);
    }

    #[test]
    fn corrupt_mark_is_reported() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.write(CLOCK_KEY, &[1, 2, 3]).unwrap();
        assert!(LogicalClock::open(backend, 4).is_err());
    }

    proptest! {
        #[test]
        fn strictly_increasing_across_restarts(
            runs in prop::collection::vec(1usize..40, 1..6),
            window in 1u64..16,
        ) {
            let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
            let mut previous = 0u64;
            for ticks in runs {
                let clock = LogicalClock::open(Arc::clone(&backend), window).unwrap();
                for _ in 0..ticks {
                    let value = clock.tick().unwrap();
                    prop_assert!(value > previous);
                    previous = value;
                }
            }
        }
    }
}
