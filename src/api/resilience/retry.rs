//! Retry policies with exponential backoff
//!
//! Transport level retries for throttling, server errors and network
//! failures. A per-request [`AttemptBudget`] caps the total number of HTTP
//! attempts across this layer and the client's re-authentication retry.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::error::ApiError;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per request, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Conservative config for production
    pub fn conservative() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            jitter: true,
        }
    }

    /// Aggressive config for development/testing
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.5,
            jitter: true,
        }
    }

    /// Retries after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_attempts = retries + 1;
        self
    }

    /// Default ceiling shared by transport retries and re-authentication.
    pub fn default_attempt_ceiling(&self) -> u32 {
        2 * (self.max_retries() + 1)
    }
}

/// Types of errors and their retry behavior
#[derive(Debug, Clone, PartialEq)]
pub enum RetryableError {
    /// The request never reached the server (connection refused, DNS, etc)
    Network,
    /// HTTP 5xx server errors
    ServerError(u16),
    /// HTTP 429 Too Many Requests
    RateLimited,
    /// HTTP 408, the server gave up before processing the request
    Timeout,
    /// The client's own per-request timeout fired. The server may still
    /// apply the request, so it is never sent again.
    DeadlineExceeded,
    /// Non-retryable client errors (4xx except 401, 408, 429)
    ClientError(u16),
    /// HTTP 401, handled by re-authentication rather than retry
    AuthError,
    /// Unknown/other errors
    Unknown,
}

impl RetryableError {
    /// Determine if this error type should be retried
    pub fn should_retry(&self) -> bool {
        match self {
            RetryableError::Network => true,
            RetryableError::ServerError(_) => true,
            RetryableError::RateLimited => true,
            RetryableError::Timeout => true,
            RetryableError::DeadlineExceeded => false,
            RetryableError::ClientError(_) => false,
            RetryableError::AuthError => false,
            RetryableError::Unknown => false,
        }
    }

    /// Classify an HTTP status code into retry behavior
    pub fn from_status_code(status: u16) -> Self {
        match status {
            401 => RetryableError::AuthError,
            408 => RetryableError::Timeout,
            429 => RetryableError::RateLimited,
            400..=499 => RetryableError::ClientError(status),
            500..=599 => RetryableError::ServerError(status),
            _ => RetryableError::Unknown,
        }
    }

    /// Classify a reqwest error. Only connect failures are known not to
    /// have reached the server; anything else after sending is `Unknown`.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            RetryableError::DeadlineExceeded
        } else if error.is_connect() {
            RetryableError::Network
        } else if let Some(status) = error.status() {
            Self::from_status_code(status.as_u16())
        } else {
            RetryableError::Unknown
        }
    }
}

/// One failed attempt, as seen by the retry loop.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub kind: RetryableError,
    pub retry_after: Option<Duration>,
    pub error: ApiError,
}

impl AttemptFailure {
    pub fn new(kind: RetryableError, error: ApiError) -> Self {
        Self {
            kind,
            retry_after: None,
            error,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    fn budget_exhausted() -> Self {
        Self::new(
            RetryableError::Unknown,
            ApiError::Unexpected {
                status: 0,
                message: "attempt budget exhausted before the request was sent".into(),
            },
        )
    }
}

/// Upper bound on HTTP attempts for one logical request.
#[derive(Debug)]
pub struct AttemptBudget {
    limit: u32,
    used: AtomicU32,
}

impl AttemptBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used: AtomicU32::new(0),
        }
    }

    /// Claim one attempt. False once the limit is reached.
    pub fn try_take(&self) -> bool {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .is_ok()
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::Acquire)
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used())
    }
}

/// Result of [`RetryPolicy::execute`] with the attempt history.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, AttemptFailure>,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

/// Retry policy that implements exponential backoff with jitter
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts, or the shared budget is spent.
    ///
    /// `operation` receives the 1-based attempt number. `on_retry` is called
    /// before each backoff sleep.
    pub async fn execute<F, Fut, T, R>(&self, budget: &AttemptBudget, mut operation: F, on_retry: R) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
        R: Fn(u32, &AttemptFailure, Duration),
    {
        let mut delays = Vec::new();
        let mut attempts = 0;
        let mut previous = Duration::ZERO;
        let mut last_failure = None;

        for attempt in 1..=self.config.max_attempts.max(1) {
            if !budget.try_take() {
                warn!("Attempt budget exhausted after {} attempts", budget.used());
                break;
            }
            attempts = attempt;
            debug!("Executing request (attempt {}/{})", attempt, self.config.max_attempts);

            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("Request succeeded after {} attempts", attempt);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        delays,
                    };
                }
                Err(failure) => {
                    let retryable = failure.kind.should_retry();
                    if !retryable || attempt >= self.config.max_attempts || budget.remaining() == 0 {
                        if retryable {
                            warn!("Request failed on final attempt {}: {}", attempt, failure.error);
                        } else {
                            debug!("Request failed permanently on attempt {}: {}", attempt, failure.error);
                        }
                        last_failure = Some(failure);
                        break;
                    }

                    let delay = self.next_delay(attempt, failure.retry_after, previous);
                    warn!("Request failed on attempt {} (retryable): {}", attempt, failure.error);
                    on_retry(attempt, &failure, delay);
                    tokio::time::sleep(delay).await;

                    delays.push(delay);
                    previous = delay;
                    last_failure = Some(failure);
                }
            }
        }

        RetryOutcome {
            result: Err(last_failure.unwrap_or_else(AttemptFailure::budget_exhausted)),
            attempts,
            delays,
        }
    }

    /// Delay before the attempt after `attempt`: backoff with jitter, raised
    /// to `Retry-After`, capped at `max_delay`, and never shorter than the
    /// previous delay.
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>, previous: Duration) -> Duration {
        let mut delay = self.calculate_delay(attempt);
        if let Some(retry_after) = retry_after {
            delay = delay.max(retry_after);
        }
        delay.min(self.config.max_delay).max(previous)
    }

    /// Calculate exponential backoff delay with optional jitter
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.config.base_delay.as_millis() as f64)
            * self.config.backoff_multiplier.powi(attempt as i32 - 1);

        let mut delay = Duration::from_millis(delay_ms as u64);

        if delay > self.config.max_delay {
            delay = self.config.max_delay;
        }

        if self.config.jitter {
            let jitter_factor = rand::rng().random_range(0.5..=1.5);
            let jittered_ms = (delay.as_millis() as f64 * jitter_factor) as u64;
            delay = Duration::from_millis(jittered_ms).min(self.config.max_delay);
        }

        delay
    }
}

/// `Retry-After` as either delta seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    (at - Utc::now()).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn throttled(attempt: u32) -> AttemptFailure {
        AttemptFailure::new(RetryableError::RateLimited, ApiError::RateLimited { attempts: attempt })
    }

    #[test]
    fn test_retryable_error_classification() {
        assert!(RetryableError::Network.should_retry());
        assert!(RetryableError::ServerError(500).should_retry());
        assert!(RetryableError::RateLimited.should_retry());
        assert!(RetryableError::Timeout.should_retry());

        assert!(!RetryableError::DeadlineExceeded.should_retry());
        assert!(!RetryableError::ClientError(400).should_retry());
        assert!(!RetryableError::AuthError.should_retry());
        assert!(!RetryableError::Unknown.should_retry());
    }

    #[test]
    fn test_status_code_classification() {
        assert_eq!(RetryableError::from_status_code(401), RetryableError::AuthError);
        assert_eq!(RetryableError::from_status_code(408), RetryableError::Timeout);
        assert_eq!(RetryableError::from_status_code(429), RetryableError::RateLimited);
        assert_eq!(RetryableError::from_status_code(403), RetryableError::ClientError(403));
        assert_eq!(RetryableError::from_status_code(404), RetryableError::ClientError(404));
        assert_eq!(RetryableError::from_status_code(503), RetryableError::ServerError(503));
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
        assert_eq!(policy.calculate_delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_cap_and_retry_after() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(policy.calculate_delay(5), Duration::from_secs(5));
        assert_eq!(
            policy.next_delay(1, Some(Duration::from_secs(3)), Duration::ZERO),
            Duration::from_secs(3)
        );
        assert_eq!(
            policy.next_delay(1, Some(Duration::from_secs(120)), Duration::ZERO),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.next_delay(1, None, Duration::from_secs(4)),
            Duration::from_secs(4)
        );
    }

    #[test]
    fn test_jittered_delays_never_decrease() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter: true,
            ..fast_config(8)
        });
        let mut previous = Duration::ZERO;
        for attempt in 1..8 {
            let delay = policy.next_delay(attempt, None, previous);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(50));
            previous = delay;
        }
    }

    #[tokio::test]
    async fn test_throttled_until_exhausted() {
        let policy = RetryPolicy::new(fast_config(4));
        let budget = AttemptBudget::new(policy.config().default_attempt_ceiling());
        let calls = Arc::new(AtomicU32::new(0));

        let outcome: RetryOutcome<()> = policy
            .execute(
                &budget,
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(throttled(attempt)) }
                },
                |_, _, _| {},
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts, 4);
        assert_eq!(outcome.delays.len(), 3);
        assert!(outcome.delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(matches!(
            outcome.result.unwrap_err().error,
            ApiError::RateLimited { attempts: 4 }
        ));
    }

    #[tokio::test]
    async fn test_success_on_second_attempt() {
        let policy = RetryPolicy::new(fast_config(3));
        let budget = AttemptBudget::new(6);
        let retries = AtomicU32::new(0);

        let outcome = policy
            .execute(
                &budget,
                |attempt| async move {
                    if attempt == 1 {
                        Err(AttemptFailure::new(
                            RetryableError::ServerError(503),
                            ApiError::Unexpected { status: 503, message: "busy".into() },
                        ))
                    } else {
                        Ok("done")
                    }
                },
                |_, _, _| {
                    retries.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts, 2);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let policy = RetryPolicy::new(fast_config(5));
        let budget = AttemptBudget::new(10);

        let outcome: RetryOutcome<()> = policy
            .execute(
                &budget,
                |_| async {
                    Err(AttemptFailure::new(
                        RetryableError::ClientError(403),
                        ApiError::PermissionDenied("users".into()),
                    ))
                },
                |_, _, _| {},
            )
            .await;

        assert_eq!(outcome.attempts, 1);
        assert!(outcome.delays.is_empty());
    }

    #[tokio::test]
    async fn test_budget_caps_attempts() {
        let policy = RetryPolicy::new(fast_config(10));
        let budget = AttemptBudget::new(2);

        let outcome: RetryOutcome<()> = policy
            .execute(&budget, |attempt| async move { Err(throttled(attempt)) }, |_, _, _| {})
            .await;
        assert_eq!(outcome.attempts, 2);
        assert_eq!(budget.remaining(), 0);

        let after: RetryOutcome<()> = policy
            .execute(&budget, |attempt| async move { Err(throttled(attempt)) }, |_, _, _| {})
            .await;
        assert_eq!(after.attempts, 0);
        assert!(matches!(after.result.unwrap_err().error, ApiError::Unexpected { status: 0, .. }));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }
}
