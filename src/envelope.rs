//! Fixed-order composition of the resilience primitives.
//!
//! Callers wrap outbound work as `Timeout ⊃ Retry ⊃ CircuitBreaker ⊃
//! RateLimiter ⊃ operation`. The order is not configurable: retrying inside a
//! breaker would defeat it, and a timeout inside retry would let attempts
//! stack past the caller's deadline.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::Result;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::timeout::with_timeout;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
pub struct ResilienceEnvelope {
    deadline: Option<Duration>,
    retry: RetryPolicy,
    breaker: Option<CircuitBreaker>,
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl std::fmt::Debug for ResilienceEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceEnvelope")
            .field("deadline", &self.deadline)
            .field("retry", &self.retry)
            .field("breaker", &self.breaker.as_ref().map(|b| b.name().to_string()))
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl Default for ResilienceEnvelope {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ResilienceEnvelope {
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new()
    }

    /// Pass-through envelope: one attempt, no deadline, no breaker, no limiter.
    pub fn none() -> Self {
        EnvelopeBuilder::new().retry(RetryPolicy::none()).build()
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        Op: FnMut() -> Fut,
    {
        let op_cell = Arc::new(Mutex::new(operation));
        let breaker = self.breaker.clone();
        let limiter = self.limiter.clone();

        let attempt = || {
            let op_cell = op_cell.clone();
            let breaker = breaker.clone();
            let limiter = limiter.clone();
            async move {
                let guarded = || async move {
                    if let Some(limiter) = &limiter {
                        limiter.wait().await;
                    }
                    let fut = {
                        let mut op = op_cell.lock().unwrap_or_else(|p| p.into_inner());
                        op()
                    };
                    fut.await
                };
                match &breaker {
                    Some(breaker) => breaker.execute(guarded).await,
                    None => guarded().await,
                }
            }
        };

        with_timeout(self.deadline, self.retry.execute(attempt)).await
    }
}

#[derive(Default)]
pub struct EnvelopeBuilder {
    deadline: Option<Duration>,
    retry: Option<RetryPolicy>,
    breaker: Option<CircuitBreaker>,
    limiter: Option<Arc<dyn RateLimiter>>,
}

impl EnvelopeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overall deadline across all attempts. Absent means unbounded.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn build(self) -> ResilienceEnvelope {
        ResilienceEnvelope {
            deadline: self.deadline,
            retry: self.retry.unwrap_or_default(),
            breaker: self.breaker,
            limiter: self.limiter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::error::{Error, ErrorKind};
    use crate::rate_limit::TokenBucket;
    use crate::sleeper::InstantSleeper;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn passes_success_through() {
        let envelope = ResilienceEnvelope::none();
        let result = envelope.execute(|| async { Ok::<_, Error>(5) }).await;
        assert_eq!(result.unwrap(), 5);
    }

    #[tokio::test]
    async fn retry_wraps_the_breaker() {
        // Breaker threshold 2, retry attempts 3: the retried failures trip
        // the breaker, and the final attempt is rejected without running.
        let breaker = CircuitBreaker::new(
            "env",
            CircuitBreakerConfig { failure_threshold: 2, ..Default::default() },
        )
        .unwrap();
        let envelope = ResilienceEnvelope::builder()
            .retry(
                RetryPolicy::builder()
                    .max_attempts(3)
                    .unwrap()
                    .sleeper(InstantSleeper)
                    .build(),
            )
            .breaker(breaker.clone())
            .build();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let err = envelope
            .execute(move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Error::timeout("downstream"))
                }
            })
            .await
            .unwrap_err();

        // Third attempt hit the open breaker; CircuitOpen surfaces unretried.
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deadline_caps_all_attempts() {
        let envelope = ResilienceEnvelope::builder()
            .deadline(Duration::from_millis(50))
            .retry(RetryPolicy::builder().max_attempts(10).unwrap().build())
            .build();

        let err = envelope
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(40)).await;
                Err::<(), _>(Error::timeout("slow"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn limiter_gates_each_attempt() {
        let limiter = Arc::new(
            TokenBucket::new(1000.0, 2).unwrap().with_sleeper(InstantSleeper),
        );
        let envelope = ResilienceEnvelope::builder()
            .retry(RetryPolicy::none())
            .limiter(limiter)
            .build();
        for _ in 0..2 {
            envelope.execute(|| async { Ok::<_, Error>(()) }).await.unwrap();
        }
    }
}
