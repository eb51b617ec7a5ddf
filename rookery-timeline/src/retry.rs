/// Retry policy with exponential backoff and jitter
use rand::Rng;
use std::{fmt::Display, time::Duration};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Scale each delay by a random factor in 0.7..1.3
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

#[derive(Debug, Error)]
#[error("Gave up after {attempts} attempts: {last}")]
pub struct RetryError<E> {
    pub attempts: u32,
    pub last: E,
}

/// Runs `operation` until it succeeds, fails with an error `retryable` rejects, or
/// `config.max_retries` retries have failed.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    what: &str,
    retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt > config.max_retries || !retryable(&error) {
                    return Err(RetryError {
                        attempts: attempt,
                        last: error,
                    });
                }

                let delay = jittered(backoff, config.jitter);
                warn!(
                    what,
                    attempt,
                    max_retries = config.max_retries,
                    ?delay,
                    %error,
                    "Retrying failed operation"
                );
                tokio::time::sleep(delay).await;

                backoff = backoff.saturating_mul(2).min(config.max_backoff);
            }
        }
    }
}

fn jittered(base: Duration, jitter: bool) -> Duration {
    if jitter {
        base.mul_f64(rand::rng().random_range(0.7..1.3))
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast(), "test", |_| true, move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, String>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast(), "test", |_| true, move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move {
                if count < 2 {
                    Err("temporary error")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&fast(), "test", |_| true, move || {
            let count = counter_clone.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(format!("failure {count}")) }
        })
        .await;

        let error = result.unwrap_err();
        assert_eq!(error.attempts, 4);
        assert_eq!(error.last, "failure 3");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn stops_on_errors_that_are_not_retryable() {
        fn temporary(error: &&str) -> bool {
            *error == "temporary"
        }

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(
            &fast(),
            "test",
            temporary,
            move || {
                let count = counter_clone.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(if count == 0 { "temporary" } else { "permanent" }) }
            },
        )
        .await;

        let error = result.unwrap_err();
        assert_eq!(error.attempts, 2);
        assert_eq!(error.last, "permanent");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let delay = jittered(base, true);
            assert!(delay >= Duration::from_millis(70) && delay <= Duration::from_millis(130));
        }
        assert_eq!(jittered(base, false), base);
    }
}
