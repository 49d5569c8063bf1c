//! Backoff schedules for retry policies.

use std::time::Duration;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone)]
pub enum Backoff {
    /// Fixed delay between attempts.
    Constant { delay: Duration },
    /// Delay grows linearly: `base * attempt`.
    Linear { base: Duration, max: Option<Duration> },
    /// Delay grows geometrically: `base * multiplier^(attempt-1)`, capped.
    Exponential { base: Duration, multiplier: f64, max: Option<Duration> },
}

impl Backoff {
    pub fn constant(delay: Duration) -> Self {
        Backoff::Constant { delay }
    }

    pub fn linear(base: Duration) -> Self {
        Backoff::Linear { base, max: None }
    }

    /// Exponential with the conventional doubling multiplier.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, multiplier: 2.0, max: None }
    }

    pub fn exponential_with_multiplier(base: Duration, multiplier: f64) -> Self {
        Backoff::Exponential { base, multiplier: multiplier.max(1.0), max: None }
    }

    /// Cap the produced delay. No effect on `Constant`.
    pub fn with_max(mut self, cap: Duration) -> Self {
        match self {
            Backoff::Linear { ref mut max, .. } => *max = Some(cap),
            Backoff::Exponential { ref mut max, .. } => *max = Some(cap),
            Backoff::Constant { .. } => {}
        }
        self
    }

    /// Delay before retry `attempt` (1-indexed). Saturates instead of
    /// overflowing for large attempt numbers.
    pub fn delay(&self, attempt: usize) -> Duration {
        match self {
            Backoff::Constant { delay } => *delay,
            Backoff::Linear { base, max } => {
                let raw = base
                    .checked_mul(attempt as u32)
                    .unwrap_or(Duration::from_secs(u64::MAX));
                max.map_or(raw, |cap| raw.min(cap))
            }
            Backoff::Exponential { base, multiplier, max } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let factor = multiplier.powi(exponent);
                let millis = (base.as_millis() as f64) * factor;
                let raw = if millis.is_finite() && millis < u64::MAX as f64 {
                    Duration::from_millis(millis as u64)
                } else {
                    Duration::from_secs(u64::MAX)
                };
                max.map_or(raw, |cap| raw.min(cap))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_never_changes() {
        let backoff = Backoff::constant(Duration::from_millis(50));
        assert_eq!(backoff.delay(1), Duration::from_millis(50));
        assert_eq!(backoff.delay(99), Duration::from_millis(50));
    }

    #[test]
    fn linear_grows_by_base() {
        let backoff = Backoff::linear(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_doubles_by_default() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_honours_multiplier_and_cap() {
        let backoff = Backoff::exponential_with_multiplier(Duration::from_millis(100), 3.0)
            .with_max(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(300));
        assert_eq!(backoff.delay(3), Duration::from_millis(900));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn large_attempts_saturate() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        let delay = backoff.delay(500);
        assert!(delay >= Duration::from_secs(1_000_000));
    }

    #[test]
    fn multiplier_below_one_is_clamped() {
        let backoff = Backoff::exponential_with_multiplier(Duration::from_millis(100), 0.5);
        assert!(backoff.delay(5) >= backoff.delay(1));
    }
}
