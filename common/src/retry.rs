//! §9 "decorator-based retry" redesign: an explicit policy object
//! `{max_attempts, base_delay, max_delay, classify}` applied at the call
//! site, instead of an implicit per-function retry decorator. `classify`
//! is `AppError::is_transient` — only errors it calls transient are
//! retried; everything else fails on the first attempt.

use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::AppError;
use crate::utils::config::AppConfig;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Runs `action` under this policy: jittered exponential backoff
    /// starting at `base_delay`, capped at `max_delay`, up to
    /// `max_attempts` total tries. An action whose error classifies as
    /// non-transient (`AppError::is_transient` returns false) fails on its
    /// first attempt without sleeping.
    pub async fn run<A, F, T>(&self, action: A) -> Result<T, AppError>
    where
        A: FnMut() -> F,
        F: std::future::Future<Output = Result<T, AppError>>,
    {
        let max_delay = self.max_delay;
        let base_delay_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX).max(1);
        let strategy = ExponentialBackoff::from_millis(base_delay_ms)
            .map(move |delay| delay.min(max_delay))
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1));

        RetryIf::spawn(strategy, action, AppError::is_transient).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transient_error() -> AppError {
        AppError::ObjectStore(object_store::Error::Generic {
            store: "test",
            source: anyhow::anyhow!("transient failure").into(),
        })
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let policy = RetryPolicy { max_attempts: 4, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5) };
        let attempts = AtomicUsize::new(0);

        let result = policy
            .run(|| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move { if attempt < 2 { Err(transient_error()) } else { Ok(42) } }
            })
            .await;

        assert_eq!(result.expect("eventually succeeds"), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy { max_attempts: 2, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5) };
        let attempts = AtomicUsize::new(0);

        let result = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(transient_error()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_without_retrying() {
        let policy = RetryPolicy { max_attempts: 5, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5) };
        let attempts = AtomicUsize::new(0);

        let result = policy
            .run(|| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AppError::Validation("bad input".to_string())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
