//! Three-state circuit breaker guarding calls to failing collaborators.
//!
//! Transitions: `Closed -[failures >= threshold]-> Open -[open_timeout
//! elapsed]-> HalfOpen -[success_threshold successes]-> Closed`. A failure in
//! `HalfOpen` re-opens immediately. `HalfOpen` admits one probe at a time;
//! concurrent callers are rejected until the probe resolves.

use crate::clock::{Clock, MonotonicClock};
use crate::error::{Error, ErrorKind, Result};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        })
    }
}

type FailurePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
type StateChangeHook = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Breaker configuration; validated at construction.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that trip the breaker.
    pub failure_threshold: u32,
    /// Successful probes in `HalfOpen` required to close.
    pub success_threshold: u32,
    /// How long `Open` lasts before a probe is admitted.
    pub open_timeout: Duration,
    /// Which errors count against the breaker. Defaults to
    /// [`Error::is_retryable`]-style transience: invalid input should not
    /// trip a breaker protecting a healthy collaborator.
    pub is_failure: Option<FailurePredicate>,
    /// Observer invoked on every state transition, in a detached task.
    pub on_state_change: Option<StateChangeHook>,
}

impl std::fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_timeout", &self.open_timeout)
            .finish()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            is_failure: None,
            on_state_change: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::invalid_config("breaker failure_threshold must be > 0"));
        }
        if self.success_threshold == 0 {
            return Err(Error::invalid_config("breaker success_threshold must be > 0"));
        }
        if self.open_timeout.is_zero() {
            return Err(Error::invalid_config("breaker open_timeout must be > 0"));
        }
        Ok(())
    }
}

/// Request counters accumulated over the breaker's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerCounters {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    probe_in_flight: bool,
    opened_at_millis: u64,
    last_transition_millis: u64,
    counters: BreakerCounters,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            probe_in_flight: false,
            opened_at_millis: 0,
            last_transition_millis: 0,
            counters: BreakerCounters::default(),
        }
    }
}

enum Admission {
    Admitted { probe: bool },
    Rejected { open_for: Duration },
}

/// Named circuit breaker wrapping an async operation.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<BreakerInner>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            name: Arc::from(name.into()),
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(BreakerInner::new())),
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the clock; used by tests to step through open timeouts.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn counters(&self) -> BreakerCounters {
        self.lock().counters
    }

    /// Force the breaker back to `Closed`, clearing failure history.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            let from = inner.state;
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.half_open_successes = 0;
            inner.probe_in_flight = false;
            inner.last_transition_millis = self.clock.now_millis();
            (from != CircuitState::Closed).then_some((from, CircuitState::Closed))
        };
        if let Some((from, to)) = transition {
            self.notify_transition(from, to);
        }
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        Op: FnOnce() -> Fut,
    {
        let probe = match self.admit() {
            Admission::Admitted { probe } => probe,
            Admission::Rejected { open_for } => {
                return Err(Error::circuit_open(format!(
                    "breaker '{}' open for {:?}",
                    self.name, open_for
                )));
            }
        };

        match operation().await {
            Ok(value) => {
                self.record_success(probe);
                Ok(value)
            }
            Err(err) => {
                if self.counts_as_failure(&err) {
                    self.record_failure(probe);
                } else {
                    // Not the collaborator's fault; release the probe slot
                    // without moving the state machine.
                    self.record_neutral(probe);
                }
                Err(err)
            }
        }
    }

    fn counts_as_failure(&self, err: &Error) -> bool {
        match &self.config.is_failure {
            Some(predicate) => predicate(err),
            None => !matches!(
                err.kind(),
                ErrorKind::InvalidInput
                    | ErrorKind::MissingRequired
                    | ErrorKind::NotFound
                    | ErrorKind::AlreadyExists
                    | ErrorKind::Cancelled
                    | ErrorKind::PermissionDenied
            ),
        }
    }

    fn admit(&self) -> Admission {
        let now = self.clock.now_millis();
        let mut transition = None;
        let admission = {
            let mut inner = self.lock();
            inner.counters.requests += 1;
            match inner.state {
                CircuitState::Closed => Admission::Admitted { probe: false },
                CircuitState::Open => {
                    let open_for = now.saturating_sub(inner.opened_at_millis);
                    if open_for >= self.config.open_timeout.as_millis() as u64 {
                        inner.state = CircuitState::HalfOpen;
                        inner.half_open_successes = 0;
                        inner.probe_in_flight = true;
                        inner.last_transition_millis = now;
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        Admission::Admitted { probe: true }
                    } else {
                        inner.counters.rejected += 1;
                        Admission::Rejected { open_for: Duration::from_millis(open_for) }
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.probe_in_flight {
                        inner.counters.rejected += 1;
                        let open_for = now.saturating_sub(inner.opened_at_millis);
                        Admission::Rejected { open_for: Duration::from_millis(open_for) }
                    } else {
                        inner.probe_in_flight = true;
                        Admission::Admitted { probe: true }
                    }
                }
            }
        };
        if let Some((from, to)) = transition {
            self.notify_transition(from, to);
        }
        admission
    }

    fn record_success(&self, probe: bool) {
        let transition = {
            let mut inner = self.lock();
            inner.counters.successes += 1;
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    if probe {
                        inner.probe_in_flight = false;
                    }
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        inner.state = CircuitState::Closed;
                        inner.consecutive_failures = 0;
                        inner.half_open_successes = 0;
                        inner.last_transition_millis = self.clock.now_millis();
                        Some((CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                // A success landing while Open means the probe raced a reset;
                // leave the state machine alone.
                CircuitState::Open => None,
            }
        };
        if let Some((from, to)) = transition {
            tracing::info!(breaker = %self.name, "circuit closed");
            self.notify_transition(from, to);
        }
    }

    fn record_failure(&self, probe: bool) {
        let now = self.clock.now_millis();
        let transition = {
            let mut inner = self.lock();
            inner.counters.failures += 1;
            match inner.state {
                CircuitState::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = CircuitState::Open;
                        inner.opened_at_millis = now;
                        inner.last_transition_millis = now;
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if probe {
                        inner.probe_in_flight = false;
                    }
                    inner.state = CircuitState::Open;
                    inner.opened_at_millis = now;
                    inner.last_transition_millis = now;
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                CircuitState::Open => None,
            }
        };
        if let Some((from, to)) = transition {
            tracing::warn!(breaker = %self.name, from = %from, "circuit opened");
            self.notify_transition(from, to);
        }
    }

    fn record_neutral(&self, probe: bool) {
        if probe {
            self.lock().probe_in_flight = false;
        }
    }

    /// Runs the observer in a detached task so the breaker lock is never held
    /// across user code.
    fn notify_transition(&self, from: CircuitState, to: CircuitState) {
        if let Some(hook) = self.config.on_state_change.clone() {
            let name = self.name.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { hook(&name, from, to) });
            } else {
                hook(&name, from, to);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
