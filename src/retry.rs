//! Retry policy with backoff, jitter, and a retryability predicate.

use crate::backoff::Backoff;
use crate::error::{Error, ErrorKind, Result};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
type RetryObserver = Arc<dyn Fn(u32, &Error, Duration) + Send + Sync>;

/// Configurable retry envelope.
///
/// `CircuitOpen` is never retried regardless of the predicate: the breaker is
/// the layer that decides when a failing collaborator may be probed again.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    is_retryable: RetryPredicate,
    on_retry: Option<RetryObserver>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().build()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Single-attempt policy: execute once, never sleep.
    pub fn none() -> Self {
        RetryPolicyBuilder::new()
            .max_attempts(1)
            .expect("1 attempt is valid")
            .build()
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        Op: FnMut() -> Fut,
    {
        let mut last_error: Option<Error> = None;

        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if err.kind() == ErrorKind::CircuitOpen {
                        return Err(err);
                    }
                    if !(self.is_retryable)(&err) {
                        return Err(err);
                    }
                    if attempt == self.max_attempts {
                        last_error = Some(err);
                        break;
                    }

                    let delay = self.jitter.apply(self.backoff.delay(attempt as usize));
                    if let Some(observer) = &self.on_retry {
                        observer(attempt, &err, delay);
                    }
                    tracing::debug!(
                        attempt,
                        next_delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    last_error = Some(err);
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        let last = last_error.expect("loop ran at least once");
        Err(Error::with_source(
            ErrorKind::MaxRetriesExceeded,
            format!("{} attempts exhausted", self.max_attempts),
            last,
        ))
    }
}

pub struct RetryPolicyBuilder {
    max_attempts: u32,
    backoff: Backoff,
    jitter: Jitter,
    is_retryable: RetryPredicate,
    on_retry: Option<RetryObserver>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(200))
                .with_max(Duration::from_secs(30)),
            jitter: Jitter::proportional(),
            is_retryable: Arc::new(Error::is_retryable),
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Result<Self> {
        if attempts == 0 {
            return Err(Error::invalid_config("retry max_attempts must be > 0"));
        }
        self.max_attempts = attempts;
        Ok(self)
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn is_retryable<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Arc::new(predicate);
        self
    }

    /// Observe each retry decision: `(attempt, error, upcoming delay)`.
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &Error, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            is_retryable: self.is_retryable,
            on_retry: self.on_retry,
            sleeper: self.sleeper,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
