//! Registry that dedups circuit breakers by name.
//!
//! Providers are keyed by name (e.g. a capability or an LLM endpoint);
//! everything calling the same collaborator shares one breaker.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    inner: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry").field("breakers", &self.snapshot()).finish()
    }
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self { default_config, inner: Arc::default() }
    }

    /// Fetch the breaker for `name`, constructing it from the default config
    /// on first use.
    pub fn get_or_create(&self, name: &str) -> Result<CircuitBreaker> {
        let mut map = self.lock();
        if let Some(existing) = map.get(name) {
            return Ok(existing.clone());
        }
        let breaker = CircuitBreaker::new(name, self.default_config.clone())?;
        map.insert(name.to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Register a breaker with non-default configuration, replacing any
    /// existing entry under the same name.
    pub fn insert(&self, breaker: CircuitBreaker) {
        self.lock().insert(breaker.name().to_string(), breaker);
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.lock().get(name).cloned()
    }

    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// All breaker states, sorted by name for stable output.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.lock();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(name, breaker)| (name.clone(), breaker.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CircuitBreaker>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn same_name_returns_same_breaker() {
        let registry = BreakerRegistry::default();
        let a = registry.get_or_create("llm").unwrap();
        let b = registry.get_or_create("llm").unwrap();

        let _ = a.execute(|| async { Err::<(), _>(Error::timeout("x")) }).await;
        assert_eq!(b.counters().failures, 1, "handles must share state");
    }

    #[test]
    fn snapshot_is_sorted() {
        let registry = BreakerRegistry::default();
        registry.get_or_create("zeta").unwrap();
        registry.get_or_create("alpha").unwrap();
        let names: Vec<String> = registry.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn reset_reports_missing_breakers() {
        let registry = BreakerRegistry::default();
        assert!(!registry.reset("ghost"));
        registry.get_or_create("real").unwrap();
        assert!(registry.reset("real"));
    }
}
