//! Retry harness for model stream acquisition.
//!
//! Wraps each attempt to open a model stream. Retriability is decided by a
//! caller-supplied classifier (defaulting to
//! [`ProviderError::is_retriable`]); provider `retry-after` hints take
//! precedence over the computed backoff.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// How successive backoff delays grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum BackoffStrategy {
    /// `min * 2^attempt`, capped at the maximum.
    #[default]
    Exponential,
    /// `min * (attempt + 1)`, capped at the maximum.
    Linear,
    /// Always the minimum delay.
    Fixed,
}

/// Backoff parameters for the harness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: usize,
    /// Smallest delay between attempts.
    pub min_backoff: Duration,
    /// Largest delay between attempts.
    pub max_backoff: Duration,
    /// Delay growth strategy.
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Compute the delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn backoff(&self, attempt: usize) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Exponential => {
                let factor = 2_u32.saturating_pow(u32::try_from(attempt).unwrap_or(u32::MAX));
                self.min_backoff.saturating_mul(factor)
            }
            BackoffStrategy::Linear => {
                let factor = u32::try_from(attempt + 1).unwrap_or(u32::MAX);
                self.min_backoff.saturating_mul(factor)
            }
            BackoffStrategy::Fixed => self.min_backoff,
        };
        delay.min(self.max_backoff)
    }
}

type Classifier = dyn Fn(&ProviderError) -> bool + Send + Sync;
type RetryObserver = dyn Fn(usize, &ProviderError, Duration) + Send + Sync;
type ExhaustedObserver = dyn Fn(&ProviderError) + Send + Sync;

/// Drives an async operation through a [`RetryPolicy`].
pub struct RetryHarness {
    policy: RetryPolicy,
    classifier: Option<Box<Classifier>>,
    on_retry: Option<Box<RetryObserver>>,
    on_exhausted: Option<Box<ExhaustedObserver>>,
}

impl std::fmt::Debug for RetryHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHarness")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for RetryHarness {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryHarness {
    /// Create a harness with the given policy and the default classifier.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: None,
            on_retry: None,
            on_exhausted: None,
        }
    }

    /// Install a custom retryability classifier.
    #[must_use]
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&ProviderError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    /// Observe each retry: `(attempt, error, delay)`.
    #[must_use]
    pub fn on_retry(
        mut self,
        observer: impl Fn(usize, &ProviderError, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_retry = Some(Box::new(observer));
        self
    }

    /// Observe the final error once retries are exhausted.
    #[must_use]
    pub fn on_retries_exhausted(
        mut self,
        observer: impl Fn(&ProviderError) + Send + Sync + 'static,
    ) -> Self {
        self.on_exhausted = Some(Box::new(observer));
        self
    }

    fn is_retriable(&self, error: &ProviderError) -> bool {
        self.classifier
            .as_ref()
            .map_or_else(|| error.is_retriable(), |classify| classify(error))
    }

    /// Run `operation` until it succeeds, fails non-retriably, or retries
    /// run out.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "retry succeeded");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if attempt >= self.policy.max_retries || !self.is_retriable(&error) {
                        warn!(attempt, error = %error, "giving up");
                        if let Some(observer) = &self.on_exhausted {
                            observer(&error);
                        }
                        return Err(error);
                    }
                    // A provider hint overrides the computed backoff.
                    let delay = error
                        .retry_after()
                        .unwrap_or_else(|| self.policy.backoff(attempt));
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after delay",
                    );
                    if let Some(observer) = &self.on_retry {
                        observer(attempt, &error, delay);
                    }
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            strategy: BackoffStrategy::Fixed,
        }
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(5));
    }

    #[test]
    fn linear_backoff_grows_by_step() {
        let policy = RetryPolicy {
            max_retries: 5,
            min_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(7),
            strategy: BackoffStrategy::Linear,
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(6));
        assert_eq!(policy.backoff(3), Duration::from_secs(7));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Fixed,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), policy.min_backoff);
        assert_eq!(policy.backoff(7), policy.min_backoff);
    }

    #[tokio::test]
    async fn succeeds_immediately_without_retry() {
        let harness = RetryHarness::new(fast_policy(3));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result = harness
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ProviderError>(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let harness = RetryHarness::new(fast_policy(3));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result = harness
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::transient("flaky"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let harness = RetryHarness::new(fast_policy(5));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result: std::result::Result<(), _> = harness
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::fatal("bad request"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_fires_observer() {
        let exhausted = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&exhausted);
        let harness = RetryHarness::new(fast_policy(2))
            .on_retries_exhausted(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        let result: std::result::Result<(), _> = harness
            .run(|| async { Err(ProviderError::transient("always down")) })
            .await;
        assert!(result.is_err());
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_overrides_backoff() {
        let delays = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&delays);
        let harness = RetryHarness::new(RetryPolicy {
            max_retries: 1,
            min_backoff: Duration::from_secs(100),
            max_backoff: Duration::from_secs(100),
            strategy: BackoffStrategy::Fixed,
        })
        .on_retry(move |_, _, delay| seen.lock().unwrap().push(delay));

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result = harness
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ProviderError::rate_limited(
                            "hinted",
                            Some(Duration::from_secs(2)),
                        ))
                    } else {
                        Ok(1)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(delays.lock().unwrap().as_slice(), &[Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn custom_classifier_wins() {
        let harness = RetryHarness::new(fast_policy(3)).with_classifier(|_| false);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let result: std::result::Result<(), _> = harness
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::transient("retriable by default"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
