//! Bounded retry with exponential backoff for collaborator calls.
//!
//! Every call to the LLM, the notification channel, the mail provider and the
//! similarity index goes through [`retry_with_backoff`]. Each attempt carries
//! its own timeout. Checkpoint writes never go through here.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{IndexError, LlmError, MailError, NotifyError};

/// Errors that know whether another attempt could succeed.
pub trait Retryable: std::fmt::Display {
    /// True for rate limits, timeouts and network failures.
    fn is_transient(&self) -> bool;

    /// Server-provided delay hint, if any.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Build the error reported when a single attempt exceeds its timeout.
    fn timed_out(after: Duration) -> Self;
}

/// Retry strategy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
    /// Timeout for one attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: true,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No delay between attempts (tests, local collaborators).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// Delay before attempt number `attempt + 1` (0-based retry index).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64) as u64;
        let delay = if self.jitter && capped > 0 {
            capped + (capped as f64 * 0.25 * rand::random::<f64>()) as u64
        } else {
            capped
        };
        Duration::from_millis(delay)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let result = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(policy.attempt_timeout)),
        };

        let err = match result {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        attempt += 1;
        if !err.is_transient() {
            debug!(operation, error = %err, "Permanent error, not retrying");
            return Err(err);
        }
        if attempt >= attempts {
            warn!(operation, attempts, error = %err, "Retries exhausted");
            return Err(err);
        }

        // Server hints are honoured only up to the policy cap.
        let delay = err
            .retry_after()
            .map(|hint| hint.min(policy.max_backoff))
            .unwrap_or_else(|| policy.backoff_delay(attempt - 1));
        warn!(
            operation,
            attempt,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient error, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

// ── Error classification ────────────────────────────────────────────

impl Retryable for LlmError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Timeout { .. } | LlmError::RequestFailed { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn timed_out(after: Duration) -> Self {
        LlmError::Timeout {
            provider: "llm".into(),
            after,
        }
    }
}

impl Retryable for NotifyError {
    fn is_transient(&self) -> bool {
        match self {
            NotifyError::RateLimited { .. }
            | NotifyError::Timeout { .. }
            | NotifyError::Network { .. } => true,
            NotifyError::Api { status, .. } => *status >= 500,
            NotifyError::Unreachable { .. } | NotifyError::InvalidHandle(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            NotifyError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    fn timed_out(after: Duration) -> Self {
        NotifyError::Timeout {
            name: "notifier".into(),
            after,
        }
    }
}

impl Retryable for MailError {
    fn is_transient(&self) -> bool {
        matches!(self, MailError::Unavailable(_) | MailError::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        MailError::Timeout(after)
    }
}

impl Retryable for IndexError {
    fn is_transient(&self) -> bool {
        matches!(self, IndexError::Unavailable(_) | IndexError::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        IndexError::Timeout(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn server_delay_hint_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 2,
            max_backoff: Duration::from_millis(50),
            jitter: false,
            ..RetryPolicy::default()
        };
        let calls = Arc::new(AtomicU32::new(0));

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            retry_with_backoff(&policy, "notifier.send", || {
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(NotifyError::RateLimited {
                            name: "telegram".into(),
                            retry_after: Some(Duration::from_secs(3600)),
                        })
                    } else {
                        Ok("sent")
                    }
                }
            }),
        )
        .await
        .expect("hour-long hint must not be slept");

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff_delay(1).as_millis();
            assert!((1000..=1250).contains(&d), "delay {d} out of range");
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<u32, MailError> =
            retry_with_backoff(&RetryPolicy::immediate(3), "fetch", || {
                let c = Arc::clone(&c);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(MailError::Unavailable("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), LlmError> =
            retry_with_backoff(&RetryPolicy::immediate(5), "classify", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(LlmError::InvalidRequest {
                        provider: "test".into(),
                        reason: "unsafe".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(LlmError::InvalidRequest { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), NotifyError> =
            retry_with_backoff(&RetryPolicy::immediate(3), "send", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(NotifyError::Network {
                        name: "test".into(),
                        reason: "reset".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_attempt_times_out() {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(10),
            ..RetryPolicy::immediate(1)
        };
        let result: Result<(), IndexError> = retry_with_backoff(&policy, "query", || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(IndexError::Timeout(_))));
    }

    #[test]
    fn unreachable_recipient_is_permanent() {
        let err = NotifyError::Unreachable {
            recipient: "42".into(),
            reason: "blocked".into(),
        };
        assert!(!err.is_transient());
        let server = NotifyError::Api {
            name: "telegram".into(),
            status: 502,
            reason: "bad gateway".into(),
        };
        assert!(server.is_transient());
    }
}
