//! Rate limiting for outbound calls to external collaborators.
//!
//! Two strategies share the [`RateLimiter`] trait; a provider-keyed registry
//! lazily constructs one limiter per collaborator.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{Error, Result};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[async_trait]
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Take a permit if one is immediately available.
    fn try_acquire(&self) -> bool;

    /// Suspend until a permit is available.
    async fn wait(&self);

    /// Steady-state permits per second.
    fn limit(&self) -> f64;
}

fn poll_interval(rate_per_sec: f64) -> Duration {
    // Poll no slower than the token period, capped at 100ms so bursts are
    // picked up promptly.
    let period = Duration::from_secs_f64(1.0 / rate_per_sec.max(0.001));
    period.min(Duration::from_millis(100))
}

/// Token bucket: `burst` capacity refilled at `rate_per_sec`.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_millis: u64,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: u32) -> Result<Self> {
        if rate_per_sec <= 0.0 {
            return Err(Error::invalid_config("token bucket rate must be > 0"));
        }
        if burst == 0 {
            return Err(Error::invalid_config("token bucket burst must be > 0"));
        }
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Ok(Self {
            rate_per_sec,
            burst: burst as f64,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last_refill_millis: clock.now_millis(),
            }),
            clock,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        self.state.get_mut().unwrap_or_else(|p| p.into_inner()).last_refill_millis =
            clock.now_millis();
        self.clock = clock;
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now_millis();
        let elapsed_millis = now.saturating_sub(state.last_refill_millis);
        if elapsed_millis > 0 {
            let refill = (elapsed_millis as f64 / 1000.0) * self.rate_per_sec;
            state.tokens = (state.tokens + refill).min(self.burst);
            state.last_refill_millis = now;
        }
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    async fn wait(&self) {
        let interval = poll_interval(self.rate_per_sec);
        loop {
            if self.try_acquire() {
                return;
            }
            self.sleeper.sleep(interval).await;
        }
    }

    fn limit(&self) -> f64 {
        self.rate_per_sec
    }
}

/// Sliding window: at most `max_requests` admissions per `window`.
#[derive(Debug)]
pub struct SlidingWindow {
    window: Duration,
    max_requests: usize,
    timestamps: Mutex<VecDeque<u64>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl SlidingWindow {
    pub fn new(window: Duration, max_requests: usize) -> Result<Self> {
        if window.is_zero() {
            return Err(Error::invalid_config("sliding window duration must be > 0"));
        }
        if max_requests == 0 {
            return Err(Error::invalid_config("sliding window max_requests must be > 0"));
        }
        Ok(Self {
            window,
            max_requests,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests)),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }
}

#[async_trait]
impl RateLimiter for SlidingWindow {
    fn try_acquire(&self) -> bool {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(self.window.as_millis() as u64);
        let mut timestamps = self.timestamps.lock().unwrap_or_else(|p| p.into_inner());
        while timestamps.front().is_some_and(|&t| t <= cutoff) {
            timestamps.pop_front();
        }
        if timestamps.len() < self.max_requests {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    async fn wait(&self) {
        let interval = poll_interval(self.limit());
        loop {
            if self.try_acquire() {
                return;
            }
            self.sleeper.sleep(interval).await;
        }
    }

    fn limit(&self) -> f64 {
        self.max_requests as f64 / self.window.as_secs_f64()
    }
}

/// Per-provider limiter policy.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LimiterPolicy {
    TokenBucket { rate_per_sec: f64, burst: u32 },
    SlidingWindow { window: Duration, max_requests: usize },
}

impl LimiterPolicy {
    /// 60 requests/minute with burst 10, the common free-tier LLM quota.
    pub fn llm_default() -> Self {
        LimiterPolicy::TokenBucket { rate_per_sec: 1.0, burst: 10 }
    }

    fn build(&self) -> Result<Arc<dyn RateLimiter>> {
        Ok(match self {
            LimiterPolicy::TokenBucket { rate_per_sec, burst } => {
                Arc::new(TokenBucket::new(*rate_per_sec, *burst)?)
            }
            LimiterPolicy::SlidingWindow { window, max_requests } => {
                Arc::new(SlidingWindow::new(*window, *max_requests)?)
            }
        })
    }
}

/// Provider-keyed registry; limiters are constructed on first use.
#[derive(Clone)]
pub struct LimiterRegistry {
    default_policy: LimiterPolicy,
    policies: Arc<HashMap<String, LimiterPolicy>>,
    limiters: Arc<Mutex<HashMap<String, Arc<dyn RateLimiter>>>>,
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("default_policy", &self.default_policy)
            .finish()
    }
}

impl LimiterRegistry {
    pub fn new(default_policy: LimiterPolicy) -> Self {
        Self::with_policies(default_policy, HashMap::new())
    }

    pub fn with_policies(
        default_policy: LimiterPolicy,
        policies: HashMap<String, LimiterPolicy>,
    ) -> Self {
        Self {
            default_policy,
            policies: Arc::new(policies),
            limiters: Arc::default(),
        }
    }

    pub fn get_or_create(&self, provider: &str) -> Result<Arc<dyn RateLimiter>> {
        let mut limiters = self.limiters.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = limiters.get(provider) {
            return Ok(existing.clone());
        }
        let policy = self.policies.get(provider).unwrap_or(&self.default_policy);
        let limiter = policy.build()?;
        limiters.insert(provider.to_string(), limiter.clone());
        Ok(limiter)
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new(LimiterPolicy::llm_default())
    }
}
