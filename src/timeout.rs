//! Deadline enforcement for async operations.
//!
//! [`with_timeout`] bounds a single operation. [`TimeoutManager`] adds a
//! slow-operation observer, and [`AdaptiveTimeout`] tunes the deadline from a
//! sliding window of observed successful durations.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Run `operation` under a deadline. `None` means no deadline; the operation
/// runs to completion.
pub async fn with_timeout<T, Fut>(deadline: Option<Duration>, operation: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match deadline {
        None => operation.await,
        Some(limit) => {
            let start = Instant::now();
            match tokio::time::timeout(limit, operation).await {
                Ok(result) => result,
                Err(_) => Err(Error::timeout(format!(
                    "deadline {:?} exceeded after {:?}",
                    limit,
                    start.elapsed()
                ))),
            }
        }
    }
}

type SlowOpHook = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Applies a default deadline and reports operations that finish slower than
/// a threshold (but inside the deadline).
#[derive(Clone)]
pub struct TimeoutManager {
    default_deadline: Duration,
    slow_threshold: Option<Duration>,
    on_slow: Option<SlowOpHook>,
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("default_deadline", &self.default_deadline)
            .field("slow_threshold", &self.slow_threshold)
            .finish()
    }
}

impl TimeoutManager {
    pub fn new(default_deadline: Duration) -> Result<Self> {
        if default_deadline.is_zero() {
            return Err(Error::invalid_config(
                "timeout manager deadline must be > 0; omit the deadline for unbounded operations",
            ));
        }
        Ok(Self { default_deadline, slow_threshold: None, on_slow: None })
    }

    pub fn on_slow<F>(mut self, threshold: Duration, hook: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.slow_threshold = Some(threshold);
        self.on_slow = Some(Arc::new(hook));
        self
    }

    pub fn default_deadline(&self) -> Duration {
        self.default_deadline
    }

    pub async fn execute<T, Fut>(&self, name: &str, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = with_timeout(Some(self.default_deadline), operation).await;
        if result.is_ok() {
            let elapsed = start.elapsed();
            if let (Some(threshold), Some(hook)) = (self.slow_threshold, &self.on_slow) {
                if elapsed > threshold {
                    hook(name, elapsed);
                }
            }
        }
        result
    }
}

/// Deadline that follows the observed latency distribution.
///
/// Keeps the last `window_size` successful durations; the next deadline is
/// `avg * (1 + percentile)` clamped to `[base/2, base*3]`. Until the window
/// has samples, the base deadline applies.
#[derive(Clone)]
pub struct AdaptiveTimeout {
    base: Duration,
    percentile: f64,
    window_size: usize,
    samples: Arc<Mutex<VecDeque<Duration>>>,
}

impl std::fmt::Debug for AdaptiveTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveTimeout")
            .field("base", &self.base)
            .field("current", &self.current_deadline())
            .finish()
    }
}

impl AdaptiveTimeout {
    pub fn new(base: Duration, percentile: f64, window_size: usize) -> Result<Self> {
        if base.is_zero() {
            return Err(Error::invalid_config("adaptive timeout base must be > 0"));
        }
        if !(0.0..=1.0).contains(&percentile) {
            return Err(Error::invalid_config("adaptive timeout percentile must be in [0, 1]"));
        }
        if window_size == 0 {
            return Err(Error::invalid_config("adaptive timeout window must hold >= 1 sample"));
        }
        Ok(Self {
            base,
            percentile,
            window_size,
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
        })
    }

    pub fn record(&self, duration: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.len() == self.window_size {
            samples.pop_front();
        }
        samples.push_back(duration);
    }

    pub fn current_deadline(&self) -> Duration {
        let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.is_empty() {
            return self.base;
        }
        let total: Duration = samples.iter().sum();
        let avg = total / samples.len() as u32;
        let scaled = avg.mul_f64(1.0 + self.percentile);
        scaled.clamp(self.base / 2, self.base * 3)
    }

    pub async fn execute<T, Fut>(&self, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let deadline = self.current_deadline();
        let start = Instant::now();
        let result = with_timeout(Some(deadline), operation).await;
        if result.is_ok() {
            self.record(start.elapsed());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn completes_inside_deadline() {
        let result =
            with_timeout(Some(Duration::from_millis(200)), async { Ok::<_, Error>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn deadline_expiry_returns_timeout() {
        let result = with_timeout(Some(Duration::from_millis(20)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(())
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn no_deadline_runs_to_completion() {
        let result = with_timeout(None, async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, Error>("done")
        })
        .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn inner_errors_pass_through_untouched() {
        let result = with_timeout(Some(Duration::from_secs(1)), async {
            Err::<(), _>(Error::invalid_input("boom"))
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn slow_hook_fires_for_slow_successes_only() {
        let slow_count = Arc::new(AtomicU32::new(0));
        let counter = slow_count.clone();
        let manager = TimeoutManager::new(Duration::from_secs(1))
            .unwrap()
            .on_slow(Duration::from_millis(10), move |_name, _elapsed| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        manager.execute("fast", async { Ok::<_, Error>(()) }).await.unwrap();
        assert_eq!(slow_count.load(Ordering::SeqCst), 0);

        manager
            .execute("slow", async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok::<_, Error>(())
            })
            .await
            .unwrap();
        assert_eq!(slow_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn adaptive_deadline_starts_at_base() {
        let adaptive = AdaptiveTimeout::new(Duration::from_secs(2), 0.95, 10).unwrap();
        assert_eq!(adaptive.current_deadline(), Duration::from_secs(2));
    }

    #[test]
    fn adaptive_deadline_tracks_average() {
        let adaptive = AdaptiveTimeout::new(Duration::from_secs(2), 0.95, 10).unwrap();
        for _ in 0..10 {
            adaptive.record(Duration::from_secs(1));
        }
        // avg 1s * 1.95 = 1.95s, inside [1s, 6s]
        assert_eq!(adaptive.current_deadline(), Duration::from_millis(1950));
    }

    #[test]
    fn adaptive_deadline_is_clamped() {
        let adaptive = AdaptiveTimeout::new(Duration::from_secs(2), 0.95, 4).unwrap();
        for _ in 0..4 {
            adaptive.record(Duration::from_millis(1));
        }
        assert_eq!(adaptive.current_deadline(), Duration::from_secs(1)); // base/2

        for _ in 0..4 {
            adaptive.record(Duration::from_secs(60));
        }
        assert_eq!(adaptive.current_deadline(), Duration::from_secs(6)); // base*3
    }

    #[test]
    fn adaptive_window_evicts_oldest() {
        let adaptive = AdaptiveTimeout::new(Duration::from_secs(2), 0.0, 2).unwrap();
        adaptive.record(Duration::from_secs(10));
        adaptive.record(Duration::from_secs(2));
        adaptive.record(Duration::from_secs(2));
        // Window holds [2s, 2s]; 10s sample evicted.
        assert_eq!(adaptive.current_deadline(), Duration::from_secs(2));
    }

    #[test]
    fn constructors_validate() {
        assert!(TimeoutManager::new(Duration::ZERO).is_err());
        assert!(AdaptiveTimeout::new(Duration::ZERO, 0.5, 4).is_err());
        assert!(AdaptiveTimeout::new(Duration::from_secs(1), 1.5, 4).is_err());
        assert!(AdaptiveTimeout::new(Duration::from_secs(1), 0.5, 0).is_err());
    }
}
