//! Error types shared across the orchestration core.
//!
//! Every fallible operation returns [`Error`], a kind-tagged error that keeps
//! its cause chain. Callers match on [`ErrorKind`] (or walk the chain with
//! [`Error::has_kind`]) instead of downcasting, and distinguish transient from
//! permanent failures via [`Error::is_retryable`].

use std::fmt;
use std::sync::Arc;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classification tag carried by every [`Error`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    thiserror::Error,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("invalid configuration")]
    InvalidConfig,
    #[error("invalid input")]
    InvalidInput,
    #[error("missing required field")]
    MissingRequired,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("closed")]
    Closed,
    #[error("timeout")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
    #[error("rate limited")]
    RateLimited,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("authentication failed")]
    AuthFailed,
    #[error("permission denied")]
    PermissionDenied,
    #[error("queue full")]
    QueueFull,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("circuit open")]
    CircuitOpen,
    #[error("too many requests")]
    TooManyRequests,
    #[error("no eligible worker")]
    NoEligibleWorker,
    #[error("dependency failed")]
    DependencyFailed,
    #[error("max retries exceeded")]
    MaxRetriesExceeded,
    #[error("panic")]
    Panic,
    #[error("internal")]
    Internal,
}

impl ErrorKind {
    /// Default transience classification for this kind. Individual errors can
    /// override it with [`Error::retryable`] / [`Error::permanent`].
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::TooManyRequests
                | ErrorKind::QueueFull
                | ErrorKind::Internal
        )
    }
}

/// Kind-tagged error with an optional cause chain.
///
/// The cause and captured backtrace are stored as `Arc` so errors stay
/// cheaply cloneable; task results fan out to multiple waiters.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    retryable: Option<bool>,
    backtrace: Option<Arc<str>>,
    source: Option<Arc<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), retryable: None, backtrace: None, source: None }
    }

    /// Wrap `source` as the cause of a new error.
    pub fn with_source(kind: ErrorKind, message: impl Into<String>, source: Error) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: None,
            backtrace: None,
            source: Some(Arc::new(source)),
        }
    }

    /// Attach a captured stack trace (recovered panics carry one).
    pub fn with_backtrace(mut self, backtrace: impl Into<String>) -> Self {
        self.backtrace = Some(Arc::from(backtrace.into()));
        self
    }

    /// Mark this error transient regardless of its kind's default.
    pub fn retryable(mut self) -> Self {
        self.retryable = Some(true);
        self
    }

    /// Mark this error permanent regardless of its kind's default.
    pub fn permanent(mut self) -> Self {
        self.retryable = Some(false);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack trace captured where the error originated, if any. Walks the
    /// cause chain so wrapping a panic does not lose it.
    pub fn backtrace(&self) -> Option<&str> {
        if let Some(backtrace) = self.backtrace.as_deref() {
            return Some(backtrace);
        }
        let mut cause = self.source.as_deref();
        while let Some(err) = cause {
            if let Some(backtrace) = err.backtrace.as_deref() {
                return Some(backtrace);
            }
            cause = err.source.as_deref();
        }
        None
    }

    /// True if this error, or any error in its cause chain, has `kind`.
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }
        let mut cause = self.source.as_deref();
        while let Some(err) = cause {
            if err.kind == kind {
                return true;
            }
            cause = err.source.as_deref();
        }
        false
    }

    /// Whether a retry has any chance of succeeding.
    ///
    /// An explicit marker wins; otherwise the kind's default applies.
    /// `CircuitOpen` is never retryable, markers notwithstanding: retrying a
    /// tripped breaker defeats it.
    pub fn is_retryable(&self) -> bool {
        if self.kind == ErrorKind::CircuitOpen {
            return false;
        }
        self.retryable.unwrap_or_else(|| self.kind.default_retryable())
    }

    /// The innermost error in the chain.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Some(source) = current.source.as_deref() {
            current = source;
        }
        current
    }

    pub fn cause(&self) -> Option<&Error> {
        self.source.as_deref()
    }

    // Shorthand constructors for the kinds built in hot paths.

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Closed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn queue_full(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueFull, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PayloadTooLarge, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn no_eligible_worker(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoEligibleWorker, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as &dyn std::error::Error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(ErrorKind::InvalidInput, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn display_includes_kind_and_message() {
        let err = Error::timeout("dispatch to worker-1");
        let msg = err.to_string();
        assert!(msg.contains("timeout"));
        assert!(msg.contains("worker-1"));
    }

    #[test]
    fn has_kind_walks_the_chain() {
        let inner = Error::timeout("handler deadline");
        let outer = Error::with_source(ErrorKind::MaxRetriesExceeded, "3 attempts", inner);
        assert!(outer.has_kind(ErrorKind::MaxRetriesExceeded));
        assert!(outer.has_kind(ErrorKind::Timeout));
        assert!(!outer.has_kind(ErrorKind::QueueFull));
    }

    #[test]
    fn retryable_defaults_follow_kind() {
        assert!(Error::timeout("t").is_retryable());
        assert!(Error::new(ErrorKind::TooManyRequests, "429").is_retryable());
        assert!(!Error::invalid_input("bad payload").is_retryable());
        assert!(!Error::not_found("missing").is_retryable());
    }

    #[test]
    fn explicit_markers_override_defaults() {
        assert!(!Error::timeout("t").permanent().is_retryable());
        assert!(Error::invalid_input("flaky validator").retryable().is_retryable());
    }

    #[test]
    fn circuit_open_is_never_retryable() {
        assert!(!Error::circuit_open("provider-x").is_retryable());
        assert!(!Error::circuit_open("provider-x").retryable().is_retryable());
    }

    #[test]
    fn backtrace_survives_wrapping() {
        assert!(Error::timeout("t").backtrace().is_none());

        let panicked = Error::new(ErrorKind::Panic, "handler panicked")
            .with_backtrace("0: drover::worker::run_handler\n1: ...");
        assert!(panicked.backtrace().unwrap().contains("run_handler"));

        let wrapped = Error::with_source(ErrorKind::MaxRetriesExceeded, "3 attempts", panicked);
        assert!(wrapped.backtrace().unwrap().contains("run_handler"));
    }

    #[test]
    fn source_chain_is_exposed() {
        let inner = Error::queue_full("agent queue at 1024");
        let outer = Error::with_source(ErrorKind::Internal, "send failed", inner);
        let source = outer.source().expect("source present");
        assert!(source.to_string().contains("queue full"));
        assert_eq!(outer.root_cause().kind(), ErrorKind::QueueFull);
    }
}
