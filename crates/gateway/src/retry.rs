use std::fmt::Display;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::error::ProviderError;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for ProviderError {
    fn is_transient(&self) -> bool {
        ProviderError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        ProviderError::retry_after(self)
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Non-retryable failure; returned on the attempt it happened
    Fatal { attempts: usize, error: E },
    /// Every allowed attempt failed transiently; `error` is the last one
    Exhausted { attempts: usize, error: E },
    Cancelled { attempts: usize },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_retries, config.base_delay_ms, config.max_delay_ms)
    }

    /// The first attempt plus `max_retries` retries
    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// `min(base × 2^(attempt-1), max)` for the 1-based failed attempt
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as u32;
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails fatally, runs out of attempts or is
    /// cancelled. Returns the value with the number of attempts used.
    pub async fn retry<F, Fut, T, E>(
        &self,
        operation_name: &str,
        cancel: &CancelToken,
        mut f: F,
    ) -> Result<(T, usize), RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }

            let result = tokio::select! {
                result = f() => result,
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt + 1 });
                }
            };
            attempt += 1;

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = operation_name,
                            attempts = attempt,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok((value, attempt));
                }
                Err(e) if !e.is_transient() => {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                    return Err(RetryError::Fatal {
                        attempts: attempt,
                        error: e,
                    });
                }
                Err(e) => {
                    if attempt >= self.max_attempts() {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Operation failed after max retries"
                        );
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            error: e,
                        });
                    }

                    let mut backoff = self.delay_for(attempt);
                    if let Some(hint) = e.retry_after() {
                        backoff = backoff.max(hint).min(self.max_delay);
                    }

                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        max_retries = self.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );

                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: attempt });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::new(5, 100, 1000);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn last_retry_can_still_succeed() {
        for max_retries in [0, 1, 3] {
            let policy = RetryPolicy::new(max_retries, 1, 2);
            let calls = AtomicUsize::new(0);
            let result = policy
                .retry("flaky", &CancelToken::new(), || {
                    let call = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if call < max_retries {
                            Err(ProviderError::Timeout("slow".into()))
                        } else {
                            Ok("ok")
                        }
                    }
                })
                .await;

            assert!(matches!(result, Ok(("ok", attempts)) if attempts == max_retries + 1));
            assert_eq!(calls.load(Ordering::SeqCst), max_retries + 1);
        }
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let policy = RetryPolicy::new(3, 1, 2);
        let calls = AtomicUsize::new(0);
        let result: Result<((), usize), _> = policy
            .retry("auth", &CancelToken::new(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Authentication("bad key".into())) }
            })
            .await;

        assert!(matches!(result, Err(RetryError::Fatal { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let policy = RetryPolicy::new(10, 50, 50);
        let cancel = CancelToken::new();
        cancel.cancel_after(Duration::from_millis(10));

        let result: Result<((), usize), _> = policy
            .retry("slow", &cancel, || async {
                Err(ProviderError::Timeout("slow".into()))
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { .. })));
    }
}
