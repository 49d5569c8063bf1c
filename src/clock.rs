//! Clock abstraction so breaker timeouts, heartbeat lapses, and autoscaler
//! cooldowns can be driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Milliseconds elapsed on a monotonic timeline. The origin is arbitrary;
    /// only differences are meaningful.
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Hand-advanced clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_millis(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, duration: std::time::Duration) {
        self.advance_millis(duration.as_millis() as u64);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock::default();
        let a = clock.now_millis();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.now_millis() >= a);
    }

    #[test]
    fn manual_clock_only_moves_when_told() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_millis(), 0);
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now_millis(), 30_000);
        let other = clock.clone();
        other.advance_millis(500);
        assert_eq!(clock.now_millis(), 30_500);
    }
}
