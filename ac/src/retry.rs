//! Retry/backoff engine and error classification
//!
//! Failures are classified into an [`ErrorKind`] once, up front; the hot
//! path never re-inspects stringified errors. Rate-limited failures draw
//! from their own, larger budget and honor the provider's suggested delay
//! when one is present.

use std::time::Duration;

use rand::Rng;
use regex::Regex;
use std::sync::LazyLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::domain::ErrorKind;
use crate::llm::InvokeError;

static RATE_LIMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)rate.?limit|too many requests|429|quota exceeded").unwrap());
static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)temporarily unavailable|try again").unwrap());

/// Map an invoker error to its abstract kind
///
/// Structured variants map directly; `Api`/`Other` fall back to message
/// patterns before landing on `InternalError`.
pub fn classify(error: &InvokeError) -> ErrorKind {
    match error {
        InvokeError::RateLimited { .. } => ErrorKind::RateLimited,
        InvokeError::Timeout(_) => ErrorKind::Timeout,
        InvokeError::Empty => ErrorKind::EmptyOutput,
        InvokeError::Unavailable(_) => ErrorKind::TransientUnavailable,
        InvokeError::Cancelled => ErrorKind::Cancelled,
        InvokeError::Api { status: 429, .. } => ErrorKind::RateLimited,
        InvokeError::Api { status, message } if *status >= 500 => {
            let _ = message;
            ErrorKind::TransientUnavailable
        }
        InvokeError::Api { message, .. } | InvokeError::Other(message) => classify_message(message),
    }
}

fn classify_message(message: &str) -> ErrorKind {
    if RATE_LIMIT_RE.is_match(message) {
        ErrorKind::RateLimited
    } else if TRANSIENT_RE.is_match(message) {
        ErrorKind::TransientUnavailable
    } else {
        ErrorKind::InternalError
    }
}

/// Jitter applied to computed delays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    None,
    #[default]
    Full,
}

/// One backoff schedule
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: Jitter,
}

impl RetryPolicy {
    /// Delay before the given retry (attempt is 1-based; attempt 1 is the
    /// first retry). Jitter is applied after the exponential cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.initial_delay.as_millis() as f64 * exp;
        let capped = base.min(self.max_delay.as_millis() as f64);

        let ms = match self.jitter {
            Jitter::None => capped,
            Jitter::Full => rand::rng().random_range(0.0..=capped.max(f64::MIN_POSITIVE)),
        };
        Duration::from_millis(ms as u64)
    }
}

/// Standard and rate-limit schedules, picked per failure kind
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    pub standard: RetryPolicy,
    pub rate_limit: RetryPolicy,
}

impl RetryPolicies {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            standard: RetryPolicy {
                max_attempts: config.max_attempts,
                initial_delay: Duration::from_millis(config.initial_delay_ms),
                max_delay: Duration::from_millis(config.max_delay_ms),
                multiplier: config.multiplier,
                jitter: Jitter::Full,
            },
            rate_limit: RetryPolicy {
                max_attempts: config.rate_limit_max_attempts,
                initial_delay: Duration::from_millis(config.initial_delay_ms),
                max_delay: Duration::from_millis(config.rate_limit_max_delay_ms),
                multiplier: config.multiplier,
                jitter: Jitter::Full,
            },
        }
    }

    fn for_kind(&self, kind: ErrorKind) -> &RetryPolicy {
        if kind.uses_rate_limit_budget() {
            &self.rate_limit
        } else {
            &self.standard
        }
    }
}

/// Terminal failure after the retry budget is spent
#[derive(Debug)]
pub struct RetryFailure {
    pub kind: ErrorKind,
    pub attempts: u32,
    pub last_error: InvokeError,
}

/// Whether the engine will attempt again after a failure of this kind
///
/// Unknown invoker failures (classified `InternalError`) are retried on
/// the standard schedule; everything non-retryable in the taxonomy stops
/// immediately.
fn engine_retries(kind: ErrorKind) -> bool {
    kind.is_retryable() || kind == ErrorKind::InternalError
}

/// Run `f` until success, non-retryable failure, exhausted budget, or
/// cancellation. Cancellation aborts both the in-flight delay and the next
/// attempt.
pub async fn execute_with_retry<T, F, Fut>(
    mut f: F,
    policies: &RetryPolicies,
    cancel: &CancellationToken,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, InvokeError>>,
{
    let mut standard_attempts: u32 = 0;
    let mut rate_attempts: u32 = 0;
    let mut total_attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryFailure {
                kind: ErrorKind::Cancelled,
                attempts: total_attempts,
                last_error: InvokeError::Cancelled,
            });
        }

        total_attempts += 1;
        let error = match f(total_attempts).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let kind = classify(&error);
        debug!(%kind, attempt = total_attempts, "attempt failed");

        if !engine_retries(kind) {
            return Err(RetryFailure {
                kind,
                attempts: total_attempts,
                last_error: error,
            });
        }

        let policy = policies.for_kind(kind);
        let budget_used = if kind.uses_rate_limit_budget() {
            rate_attempts += 1;
            rate_attempts
        } else {
            standard_attempts += 1;
            standard_attempts
        };

        if budget_used >= policy.max_attempts {
            warn!(%kind, attempts = total_attempts, "retry budget exhausted");
            return Err(RetryFailure {
                kind,
                attempts: total_attempts,
                last_error: error,
            });
        }

        // Provider-suggested delay wins for rate limits, capped by policy
        let delay = error
            .retry_after()
            .map(|d| d.min(policy.max_delay))
            .unwrap_or_else(|| policy.delay_for(budget_used));

        debug!(%kind, ?delay, "backing off");
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryFailure {
                    kind: ErrorKind::Cancelled,
                    attempts: total_attempts,
                    last_error: InvokeError::Cancelled,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_policies() -> RetryPolicies {
        RetryPolicies {
            standard: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                multiplier: 2.0,
                jitter: Jitter::None,
            },
            rate_limit: RetryPolicy {
                max_attempts: 6,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                multiplier: 2.0,
                jitter: Jitter::None,
            },
        }
    }

    #[test]
    fn test_classify_structured() {
        assert_eq!(
            classify(&InvokeError::RateLimited { retry_after: None }),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(&InvokeError::Timeout(Duration::from_secs(1))),
            ErrorKind::Timeout
        );
        assert_eq!(classify(&InvokeError::Empty), ErrorKind::EmptyOutput);
        assert_eq!(
            classify(&InvokeError::Unavailable("down".into())),
            ErrorKind::TransientUnavailable
        );
        assert_eq!(classify(&InvokeError::Cancelled), ErrorKind::Cancelled);
    }

    #[test]
    fn test_classify_message_patterns() {
        assert_eq!(
            classify(&InvokeError::Other("Rate limit exceeded".into())),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(&InvokeError::Other("Too Many Requests".into())),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(&InvokeError::Other("HTTP 429 returned".into())),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(&InvokeError::Other("quota exceeded for project".into())),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(&InvokeError::Other("Service temporarily unavailable".into())),
            ErrorKind::TransientUnavailable
        );
        assert_eq!(
            classify(&InvokeError::Other("please try again later".into())),
            ErrorKind::TransientUnavailable
        );
        assert_eq!(
            classify(&InvokeError::Other("segfault in provider".into())),
            ErrorKind::InternalError
        );
    }

    #[test]
    fn test_classify_api_status() {
        assert_eq!(
            classify(&InvokeError::Api {
                status: 429,
                message: String::new()
            }),
            ErrorKind::RateLimited
        );
        assert_eq!(
            classify(&InvokeError::Api {
                status: 503,
                message: "gateway".into()
            }),
            ErrorKind::TransientUnavailable
        );
        assert_eq!(
            classify(&InvokeError::Api {
                status: 400,
                message: "bad request".into()
            }),
            ErrorKind::InternalError
        );
    }

    #[test]
    fn test_delay_exponential_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            multiplier: 2.0,
            jitter: Jitter::None,
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(450));
        assert_eq!(policy.delay_for(8), Duration::from_millis(450));
    }

    #[test]
    fn test_full_jitter_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: Jitter::Full,
        };

        for _ in 0..50 {
            assert!(policy.delay_for(3) <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let result = execute_with_retry(
            |_| async { Ok::<_, InvokeError>(7) },
            &test_policies(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result = execute_with_retry(
            move |_| {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(InvokeError::Timeout(Duration::from_millis(1)))
                    } else {
                        Ok("done")
                    }
                }
            },
            &test_policies(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_standard_budget_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<(), _> = execute_with_retry(
            move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(InvokeError::Timeout(Duration::from_millis(1)))
                }
            },
            &test_policies(),
            &CancellationToken::new(),
        )
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_uses_larger_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<(), _> = execute_with_retry(
            move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(InvokeError::RateLimited {
                        retry_after: Some(Duration::from_millis(1)),
                    })
                }
            },
            &test_policies(),
            &CancellationToken::new(),
        )
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::RateLimited);
        // Rate-limit budget (6) rather than standard (3)
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();

        let result: Result<(), _> = execute_with_retry(
            move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(InvokeError::Cancelled)
                }
            },
            &test_policies(),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_delay() {
        let cancel = CancellationToken::new();
        let cancel_in = cancel.clone();

        let handle = tokio::spawn(async move {
            let policies = RetryPolicies {
                standard: RetryPolicy {
                    max_attempts: 5,
                    initial_delay: Duration::from_secs(3600),
                    max_delay: Duration::from_secs(3600),
                    multiplier: 1.0,
                    jitter: Jitter::None,
                },
                rate_limit: RetryPolicy {
                    max_attempts: 6,
                    initial_delay: Duration::from_secs(3600),
                    max_delay: Duration::from_secs(3600),
                    multiplier: 1.0,
                    jitter: Jitter::None,
                },
            };
            execute_with_retry(
                |_| async { Err::<(), _>(InvokeError::Timeout(Duration::from_millis(1))) },
                &policies,
                &cancel_in,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let failure = handle.await.unwrap().unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Cancelled);
    }
}
