//! Jitter strategies that spread retry delays to avoid thundering herds.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Jitter {
    /// Use the exact backoff delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`.
    Equal,
    /// `delay` plus uniform in `[0, fraction * delay]`.
    Proportional { fraction: f64 },
}

impl Jitter {
    pub fn full() -> Self {
        Jitter::Full
    }

    pub fn equal() -> Self {
        Jitter::Equal
    }

    /// The dispatch-path default: adds up to a quarter of the base delay.
    pub fn proportional() -> Self {
        Jitter::Proportional { fraction: 0.25 }
    }

    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rand::thread_rng())
    }

    /// Deterministic variant for tests.
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.gen_range(0..=millis))
            }
            Jitter::Equal => {
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.gen_range(millis / 2..=millis))
            }
            Jitter::Proportional { fraction } => {
                let spread = ((millis as f64) * fraction.max(0.0)) as u64;
                if spread == 0 {
                    return delay;
                }
                Duration::from_millis(millis.saturating_add(rng.gen_range(0..=spread)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_passes_through() {
        assert_eq!(Jitter::None.apply(Duration::from_secs(1)), Duration::from_secs(1));
    }

    #[test]
    fn full_stays_within_delay() {
        let jitter = Jitter::full();
        for _ in 0..100 {
            assert!(jitter.apply(Duration::from_secs(1)) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn equal_stays_above_half() {
        let jitter = Jitter::equal();
        for _ in 0..100 {
            let d = jitter.apply(Duration::from_secs(1));
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_secs(1));
        }
    }

    #[test]
    fn proportional_adds_at_most_fraction() {
        let jitter = Jitter::proportional();
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jitter.apply(base);
            assert!(d >= base);
            assert!(d <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn deterministic_with_seeded_rng() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let jitter = Jitter::full();
        assert_eq!(
            jitter.apply_with_rng(Duration::from_secs(1), &mut a),
            jitter.apply_with_rng(Duration::from_secs(1), &mut b)
        );
    }

    #[test]
    fn zero_delay_stays_zero() {
        assert_eq!(Jitter::full().apply(Duration::ZERO), Duration::ZERO);
        assert_eq!(Jitter::proportional().apply(Duration::ZERO), Duration::ZERO);
    }
}
