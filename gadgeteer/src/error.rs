//! Error types for the gadgeteer runtime.
//!
//! Three layers of failure exist and they deliberately do not mix:
//!
//! - [`InvocationError`] — scoped to a single gadget invocation. These never
//!   abort a batch; the executor folds them into result payloads that the
//!   model sees on the next iteration.
//! - [`ProviderError`] — raised by a model client. Retriable variants stay
//!   inside the retry harness; only exhausted or fatal errors escape.
//! - [`Error`] — what callers of the agent loop can observe. Cancellation and
//!   budget exhaustion are *not* errors; they surface as terminal events.

use std::time::Duration;

use crate::schema::SchemaViolation;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The top-level error type for agent operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A model provider failed fatally or exhausted its retries.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A genuine programming error (invariant violation, poisoned lock).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

/// Errors raised by a model client.
///
/// The retry harness consults [`ProviderError::is_retriable`] (unless the
/// caller installs its own classifier) and honours [`retry_after`] hints
/// before computing its own backoff.
///
/// [`retry_after`]: ProviderError::retry_after
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The provider throttled the request. Retriable.
    #[error("rate limited: {message}")]
    RateLimited {
        /// Provider-supplied wait hint, if any.
        retry_after: Option<Duration>,
        /// Provider message.
        message: String,
    },

    /// A transient failure (connection reset, 5xx, overloaded). Retriable.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// A non-retriable failure (bad request, auth, model unknown).
    #[error("provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Create a rate-limited error with an optional wait hint.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            retry_after,
            message: message.into(),
        }
    }

    /// Create a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Whether the default classifier considers this error retriable.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// The provider's wait hint, when one was supplied.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            Self::Transient(_) | Self::Fatal(_) => None,
        }
    }
}

/// An error scoped to one gadget invocation.
///
/// Every variant carries a distinct reason tag in its rendering so the model
/// (and any observer) can tell *why* an invocation did not produce a normal
/// result. These are payloads, not exceptions: a batch always runs to
/// completion around them.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum InvocationError {
    /// The marker block could not be parsed into a valid invocation.
    #[error("parse error: {0}")]
    Parse(String),

    /// No gadget with the requested name is registered.
    #[error("unknown gadget '{name}'; registered gadgets: {}", valid.join(", "))]
    RegistryMiss {
        /// The name the model asked for.
        name: String,
        /// Names the registry does know.
        valid: Vec<String>,
    },

    /// Parameters failed schema validation.
    #[error("schema validation failed: {0}")]
    Schema(#[from] SchemaViolation),

    /// The gadget's execute returned an uncategorized error.
    #[error("gadget execution failed: {0}")]
    Execution(String),

    /// The invocation exceeded its time limit.
    #[error("timed out after {}ms", limit.as_millis())]
    Timeout {
        /// The configured limit that fired.
        limit: Duration,
    },

    /// The invocation observed a cancellation signal.
    #[error("aborted: {0}")]
    Aborted(String),

    /// No human-input collaborator is configured.
    #[error("human input unavailable: {0}")]
    HumanInputUnavailable(String),

    /// A declared dependency finished unsuccessfully, so this invocation
    /// was never dispatched.
    #[error("skipped: dependency '{dependency}' failed: {reason}")]
    DependencyFailed {
        /// Invocation id of the failed dependency.
        dependency: String,
        /// Why the dependency failed.
        reason: String,
    },

    /// The per-response invocation cap was reached before this invocation
    /// could be dispatched.
    #[error("skipped: exceeded the limit of {limit} gadget invocations per response")]
    MaxPerResponseExceeded {
        /// The configured cap.
        limit: usize,
    },
}

impl InvocationError {
    /// Whether this error marks an invocation that was skipped rather
    /// than attempted.
    #[must_use]
    pub const fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::DependencyFailed { .. } | Self::MaxPerResponseExceeded { .. }
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn provider_retriability() {
        assert!(ProviderError::rate_limited("slow down", None).is_retriable());
        assert!(ProviderError::transient("reset").is_retriable());
        assert!(!ProviderError::fatal("bad key").is_retriable());
    }

    #[test]
    fn retry_after_only_on_rate_limits() {
        let hint = Duration::from_secs(3);
        let err = ProviderError::rate_limited("throttled", Some(hint));
        assert_eq!(err.retry_after(), Some(hint));
        assert_eq!(ProviderError::transient("x").retry_after(), None);
    }

    #[test]
    fn registry_miss_lists_valid_names() {
        let err = InvocationError::RegistryMiss {
            name: "calc".into(),
            valid: vec!["calculator".into(), "search".into()],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("calc"));
        assert!(rendered.contains("calculator, search"));
    }

    #[test]
    fn skip_variants_are_skips() {
        let dep = InvocationError::DependencyFailed {
            dependency: "gc_1".into(),
            reason: "boom".into(),
        };
        let cap = InvocationError::MaxPerResponseExceeded { limit: 2 };
        assert!(dep.is_skip());
        assert!(cap.is_skip());
        assert!(!InvocationError::Parse("bad".into()).is_skip());
    }

    #[test]
    fn timeout_renders_limit() {
        let err = InvocationError::Timeout {
            limit: Duration::from_millis(50),
        };
        assert!(err.to_string().contains("50ms"));
    }
}
