//! Environment-driven configuration.
//!
//! Every component consumes its own typed config; [`RuntimeConfig`] composes
//! them and [`RuntimeConfig::from_env`] fills them from `DROVER_*` variables.
//! Bad values fail with `InvalidConfig` naming the offending key.

use crate::autoscaler::AutoscalerConfig;
use crate::balancer::BalancerStrategy;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dedup::DedupConfig;
use crate::error::{Error, Result};
use crate::ledger::LedgerKind;
use crate::pool::PoolConfig;
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Which authoritative store backs the deduplicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupBackend {
    #[default]
    InMemory,
    StreamBroker,
    Relational,
}

impl FromStr for DedupBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-memory" => Ok(DedupBackend::InMemory),
            "stream-broker" => Ok(DedupBackend::StreamBroker),
            "relational" => Ok(DedupBackend::Relational),
            other => Err(Error::invalid_config(format!("unknown dedup backend '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub kind: LedgerKind,
    /// Connection string for the relational backend.
    #[serde(default)]
    pub url: Option<String>,
    pub max_connections: u32,
    /// Progress rows older than this are cleaned up (relational backend).
    pub progress_retention: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            kind: LedgerKind::InMemory,
            url: None,
            max_connections: 25,
            progress_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::invalid_config("ledger max_connections must be > 0"));
        }
        if matches!(self.kind, LedgerKind::Relational | LedgerKind::Hybrid)
            && self.url.as_deref().unwrap_or("").is_empty()
        {
            return Err(Error::invalid_config("relational ledger requires a url"));
        }
        Ok(())
    }
}

/// Envelope policies applied to task execution and outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_multiplier: f64,
    pub retry_jitter: bool,
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_open_timeout: Duration,
    /// Deadline applied to tasks that carry none. `None` disables it.
    #[serde(default)]
    pub default_task_deadline: Option<Duration>,
    /// Per-task-type rate limiting for handler execution; `None` disables it.
    #[serde(default)]
    pub rate_limit: Option<crate::rate_limit::LimiterPolicy>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_initial_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
            retry_jitter: true,
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_open_timeout: Duration::from_secs(30),
            default_task_deadline: Some(Duration::from_secs(300)),
            rate_limit: None,
        }
    }
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry_max_attempts == 0 {
            return Err(Error::invalid_config("resilience retry_max_attempts must be > 0"));
        }
        if self.retry_multiplier < 1.0 {
            return Err(Error::invalid_config("resilience retry_multiplier must be >= 1"));
        }
        if self.default_task_deadline.is_some_and(|d| d.is_zero()) {
            return Err(Error::invalid_config(
                "default_task_deadline of zero is ambiguous; omit it to disable deadlines",
            ));
        }
        self.breaker_config().validate()
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            success_threshold: self.breaker_success_threshold,
            open_timeout: self.breaker_open_timeout,
            ..CircuitBreakerConfig::default()
        }
    }

    pub fn retry_policy(&self) -> Result<crate::retry::RetryPolicy> {
        let backoff = crate::backoff::Backoff::exponential_with_multiplier(
            self.retry_initial_delay,
            self.retry_multiplier,
        )
        .with_max(self.retry_max_delay);
        let jitter = if self.retry_jitter {
            crate::jitter::Jitter::proportional()
        } else {
            crate::jitter::Jitter::None
        };
        Ok(crate::retry::RetryPolicy::builder()
            .max_attempts(self.retry_max_attempts)?
            .backoff(backoff)
            .jitter(jitter)
            .build())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub enabled: bool,
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { enabled: true, addr: "127.0.0.1:8080".to_string() }
    }
}

impl HttpConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(Error::invalid_config(format!("invalid http addr '{}'", self.addr)));
        }
        Ok(())
    }
}

/// Root configuration composed by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub transport: TransportConfig,
    pub ledger: LedgerConfig,
    pub dedup_enabled: bool,
    pub dedup_backend: DedupBackend,
    pub dedup: DedupConfig,
    pub autoscaler: AutoscalerConfig,
    pub balancer: BalancerStrategy,
    pub pool: PoolConfig,
    pub resilience: ResilienceConfig,
    pub http: HttpConfig,
    pub max_attempts: u32,
    pub dispatch_retry_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            ledger: LedgerConfig::default(),
            dedup_enabled: true,
            dedup_backend: DedupBackend::default(),
            dedup: DedupConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            balancer: BalancerStrategy::default(),
            pool: PoolConfig::default(),
            resilience: ResilienceConfig::default(),
            http: HttpConfig::default(),
            max_attempts: 3,
            dispatch_retry_timeout: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `DROVER_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Some(kind) = env_parse::<crate::transport::TransportKind>("DROVER_TRANSPORT")? {
            config.transport.kind = kind;
        }
        if let Some(url) = env_string("DROVER_TRANSPORT_URL") {
            config.transport.url = Some(url);
        }
        if let Some(capacity) = env_parse::<usize>("DROVER_QUEUE_CAPACITY")? {
            config.transport.queue_capacity = capacity;
        }
        if let Some(size) = env_parse::<usize>("DROVER_MAX_MESSAGE_SIZE")? {
            config.transport.max_message_size = size;
        }

        if let Some(kind) = env_parse::<LedgerKind>("DROVER_LEDGER")? {
            config.ledger.kind = kind;
        }
        if let Some(url) = env_string("DROVER_LEDGER_URL") {
            config.ledger.url = Some(url);
        }
        if let Some(conns) = env_parse::<u32>("DROVER_LEDGER_MAX_CONNECTIONS")? {
            config.ledger.max_connections = conns;
        }

        if let Some(enabled) = env_parse::<bool>("DROVER_DEDUP_ENABLED")? {
            config.dedup_enabled = enabled;
        }
        if let Some(backend) = env_parse::<DedupBackend>("DROVER_DEDUP_BACKEND")? {
            config.dedup_backend = backend;
        }
        if let Some(secs) = env_parse::<u64>("DROVER_DEDUP_TTL_SECS")? {
            config.dedup.ttl = Duration::from_secs(secs);
        }

        if let Some(preset) = env_string("DROVER_AUTOSCALE_PRESET") {
            config.autoscaler = match preset.as_str() {
                "conservative" => AutoscalerConfig::conservative(),
                "aggressive" => AutoscalerConfig::aggressive(),
                "cost-optimised" => AutoscalerConfig::cost_optimised(),
                other => {
                    return Err(Error::invalid_config(format!(
                        "unknown autoscale preset '{other}'"
                    )))
                }
            };
        }
        if let Some(enabled) = env_parse::<bool>("DROVER_AUTOSCALE_ENABLED")? {
            config.autoscaler.enabled = enabled;
        }
        if let Some(min) = env_parse::<usize>("DROVER_AUTOSCALE_MIN")? {
            config.autoscaler.min_workers = min;
        }
        if let Some(max) = env_parse::<usize>("DROVER_AUTOSCALE_MAX")? {
            config.autoscaler.max_workers = max;
        }
        if let Some(step) = env_parse::<usize>("DROVER_AUTOSCALE_STEP")? {
            config.autoscaler.scale_up_step = step;
        }
        if let Some(secs) = env_parse::<u64>("DROVER_AUTOSCALE_COOLDOWN_UP_SECS")? {
            config.autoscaler.cooldown_up = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("DROVER_AUTOSCALE_COOLDOWN_DOWN_SECS")? {
            config.autoscaler.cooldown_down = Duration::from_secs(secs);
        }

        if let Some(strategy) = env_parse::<BalancerStrategy>("DROVER_BALANCER")? {
            config.balancer = strategy;
        }

        if let Some(attempts) = env_parse::<u32>("DROVER_MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }
        if let Some(secs) = env_parse::<u64>("DROVER_TASK_DEADLINE_SECS")? {
            // Zero means "no deadline", not "fail immediately".
            config.resilience.default_task_deadline =
                (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(attempts) = env_parse::<u32>("DROVER_RETRY_MAX_ATTEMPTS")? {
            config.resilience.retry_max_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("DROVER_RETRY_INITIAL_DELAY_MS")? {
            config.resilience.retry_initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("DROVER_RETRY_MAX_DELAY_MS")? {
            config.resilience.retry_max_delay = Duration::from_millis(ms);
        }
        if let Some(multiplier) = env_parse::<f64>("DROVER_RETRY_MULTIPLIER")? {
            config.resilience.retry_multiplier = multiplier;
        }
        if let Some(jitter) = env_parse::<bool>("DROVER_RETRY_JITTER")? {
            config.resilience.retry_jitter = jitter;
        }
        if let Some(threshold) = env_parse::<u32>("DROVER_BREAKER_FAILURE_THRESHOLD")? {
            config.resilience.breaker_failure_threshold = threshold;
        }
        if let Some(threshold) = env_parse::<u32>("DROVER_BREAKER_SUCCESS_THRESHOLD")? {
            config.resilience.breaker_success_threshold = threshold;
        }
        if let Some(secs) = env_parse::<u64>("DROVER_BREAKER_OPEN_TIMEOUT_SECS")? {
            config.resilience.breaker_open_timeout = Duration::from_secs(secs);
        }
        if let Some(rps) = env_parse::<f64>("DROVER_RATE_LIMIT_RPS")? {
            let burst = env_parse::<u32>("DROVER_RATE_LIMIT_BURST")?.unwrap_or(10);
            config.resilience.rate_limit =
                Some(crate::rate_limit::LimiterPolicy::TokenBucket { rate_per_sec: rps, burst });
        }

        if let Some(secs) = env_parse::<u64>("DROVER_HEARTBEAT_INTERVAL_SECS")? {
            config.pool.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("DROVER_SHUTDOWN_TIMEOUT_SECS")? {
            config.pool.shutdown_timeout = Duration::from_secs(secs);
        }

        if let Some(addr) = env_string("DROVER_HTTP_ADDR") {
            if addr.is_empty() {
                config.http.enabled = false;
            } else {
                config.http.addr = addr;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.transport.validate()?;
        self.ledger.validate()?;
        self.dedup.validate()?;
        self.autoscaler.validate()?;
        self.pool.validate()?;
        self.resilience.validate()?;
        self.http.validate()?;
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be > 0"));
        }
        Ok(())
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|value| value.trim().to_string())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) if raw.is_empty() => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|err| {
            Error::invalid_config(format!("bad value '{raw}' for {key}: {err}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportKind;

    #[test]
    fn defaults_validate() {
        RuntimeConfig::new().validate().unwrap();
    }

    // Env vars are process-global, so everything touching them lives in one
    // test to avoid cross-test races.
    #[test]
    fn env_loading_round_trip() {
        std::env::set_var("DROVER_BALANCER", "least-loaded");
        std::env::set_var("DROVER_MAX_ATTEMPTS", "5");
        std::env::set_var("DROVER_AUTOSCALE_MAX", "32");
        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.balancer, BalancerStrategy::LeastLoaded);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.autoscaler.max_workers, 32);
        std::env::remove_var("DROVER_BALANCER");
        std::env::remove_var("DROVER_MAX_ATTEMPTS");
        std::env::remove_var("DROVER_AUTOSCALE_MAX");

        // Zero deadline means "no deadline", not "fail immediately".
        std::env::set_var("DROVER_TASK_DEADLINE_SECS", "0");
        let config = RuntimeConfig::from_env().unwrap();
        assert!(config.resilience.default_task_deadline.is_none());
        std::env::remove_var("DROVER_TASK_DEADLINE_SECS");

        // Presets swap the whole autoscaler block.
        std::env::set_var("DROVER_AUTOSCALE_PRESET", "aggressive");
        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.autoscaler.scale_up_step, 4);
        std::env::set_var("DROVER_AUTOSCALE_PRESET", "warp-speed");
        assert!(RuntimeConfig::from_env().is_err());
        std::env::remove_var("DROVER_AUTOSCALE_PRESET");

        // Malformed values name the offending key.
        std::env::set_var("DROVER_RETRY_MAX_ATTEMPTS", "many");
        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DROVER_RETRY_MAX_ATTEMPTS"));
        std::env::remove_var("DROVER_RETRY_MAX_ATTEMPTS");
    }

    #[test]
    fn broker_transport_requires_url() {
        let mut config = RuntimeConfig::new();
        config.transport.kind = TransportKind::StreamBroker;
        assert!(config.validate().is_err());
        config.transport.url = Some("redis://localhost:6379".to_string());
        assert!(config.validate().is_ok());
    }
}
