//! Clocks for stores that keep time themselves.
//!
//! Redis supplies time through `TIME`. The in-process store needs one of
//! these instead; a clock is shared by every caller of that store, which is
//! only ever callers inside the same process.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::ratelimit::GCRA_EPOCH_UNIX_SECS;

/// Source of "now" for a store.
pub trait StoreClock: Send + Sync {
    /// Time elapsed since the clock's epoch.
    fn now(&self) -> Duration;
}

/// Wall clock measured from the same epoch the Redis scripts use.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl StoreClock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_sub(Duration::from_secs(GCRA_EPOCH_UNIX_SECS))
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same time value.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    current: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Create a clock reading `start`.
    pub fn new(start: Duration) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by;
    }

    /// Set the clock to an absolute reading.
    pub fn set(&self, to: Duration) {
        *self.current.lock() = to;
    }
}

impl StoreClock for ManualClock {
    fn now(&self) -> Duration {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_past_epoch() {
        let clock = SystemClock::new();
        // Any machine running this is well past 2017.
        assert!(clock.now() > Duration::from_secs(86400 * 365));
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::default();
        let other = clock.clone();

        other.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), Duration::from_millis(500));

        clock.set(Duration::from_secs(10));
        assert_eq!(other.now(), Duration::from_secs(10));
    }
}
