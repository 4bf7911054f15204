//! Retry policies and the async retry runner.
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt history; every
//! counter lives with the caller. [`Retry`] drives a fallible async supplier
//! with a policy and reports exhaustion as a distinct error.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

/// How the delay between attempts evolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetryBehavior {
    /// Same delay before every retry.
    #[serde(alias = "fixed")]
    Constant {
        #[serde(rename = "intervalMs")]
        interval_ms: u64,
    },

    /// Delay multiplied by `delay_factor` on each retry, capped at `max_interval_ms`.
    Exponential {
        #[serde(rename = "intervalMs")]
        interval_ms: u64,
        #[serde(rename = "delayFactor", default = "default_delay_factor")]
        delay_factor: f64,
        #[serde(rename = "maxIntervalMs")]
        max_interval_ms: u64,
    },
}

fn default_delay_factor() -> f64 {
    2.0
}

/// Retry specification attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(flatten)]
    pub behavior: RetryBehavior,

    /// Total attempts allowed, the first one included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempt: Option<u32>,

    /// Give up once this much time has elapsed since the first attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_ms: Option<u64>,

    /// End in WARNING rather than SUCCESS when a retry was needed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub warning_on_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(10),
            3,
        )
    }
}

/// Why a policy stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    MaxAttempts,
    MaxDuration,
}

impl std::fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxAttempts => write!(f, "max attempts reached"),
            Self::MaxDuration => write!(f, "max duration reached"),
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry once the duration has passed (zero means now).
    RetryAfter(Duration),
    GiveUp(GiveUpReason),
}

impl RetryPolicy {
    pub fn constant(interval: Duration, max_attempt: u32) -> Self {
        Self {
            behavior: RetryBehavior::Constant {
                interval_ms: interval.as_millis() as u64,
            },
            max_attempt: Some(max_attempt),
            max_duration_ms: None,
            warning_on_retry: false,
        }
    }

    pub fn exponential(
        interval: Duration,
        delay_factor: f64,
        max_interval: Duration,
        max_attempt: u32,
    ) -> Self {
        Self {
            behavior: RetryBehavior::Exponential {
                interval_ms: interval.as_millis() as u64,
                delay_factor,
                max_interval_ms: max_interval.as_millis() as u64,
            },
            max_attempt: Some(max_attempt),
            max_duration_ms: None,
            warning_on_retry: false,
        }
    }

    /// Rejects policies that would retry forever or never wait sensibly.
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_attempt.is_none() && self.max_duration_ms.is_none() {
            return Err(CoreError::Validation(
                "retry policy needs maxAttempt or maxDurationMs".to_string(),
            ));
        }
        if self.max_attempt == Some(0) {
            return Err(CoreError::Validation(
                "retry maxAttempt must be at least 1".to_string(),
            ));
        }
        if let RetryBehavior::Exponential {
            interval_ms,
            delay_factor,
            max_interval_ms,
        } = self.behavior
        {
            if delay_factor < 1.0 {
                return Err(CoreError::Validation(format!(
                    "retry delayFactor must be >= 1, got {}",
                    delay_factor
                )));
            }
            if max_interval_ms < interval_ms {
                return Err(CoreError::Validation(
                    "retry maxIntervalMs must be >= intervalMs".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Delay to wait after the `attempt_count`-th failed attempt.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        match self.behavior {
            RetryBehavior::Constant { interval_ms } => Duration::from_millis(interval_ms),
            RetryBehavior::Exponential {
                interval_ms,
                delay_factor,
                max_interval_ms,
            } => {
                let exponent = attempt_count.saturating_sub(1).min(64) as i32;
                let millis = (interval_ms as f64) * delay_factor.powi(exponent);
                Duration::from_millis(millis.min(max_interval_ms as f64) as u64)
            }
        }
    }

    /// Decide what to do after `attempt_count` failed attempts.
    ///
    /// `elapsed` is measured from the first attempt; the returned delay is
    /// relative to `now`, counting from `last_failure`.
    pub fn decide(
        &self,
        attempt_count: u32,
        elapsed: Duration,
        last_failure: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if let Some(max_attempt) = self.max_attempt {
            if attempt_count >= max_attempt {
                return RetryDecision::GiveUp(GiveUpReason::MaxAttempts);
            }
        }

        let delay = self.delay(attempt_count);

        if let Some(max_duration_ms) = self.max_duration_ms {
            if elapsed + delay > Duration::from_millis(max_duration_ms) {
                return RetryDecision::GiveUp(GiveUpReason::MaxDuration);
            }
        }

        let waited = (now - last_failure).to_std().unwrap_or(Duration::ZERO);
        RetryDecision::RetryAfter(delay.saturating_sub(waited))
    }

    /// Instant at which the next attempt is due, or `None` to give up.
    pub fn next_retry_date(
        &self,
        attempt_count: u32,
        elapsed: Duration,
        last_failure: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self.decide(attempt_count, elapsed, last_failure, last_failure) {
            RetryDecision::RetryAfter(delay) => {
                chrono::Duration::from_std(delay).ok().map(|d| last_failure + d)
            }
            RetryDecision::GiveUp(_) => None,
        }
    }
}

/// Details of an exhausted retry loop.
#[derive(Debug, Error)]
#[error("Stop retry, attempts {attempt_count} elapsed after {} seconds", .elapsed.as_secs())]
pub struct RetryFailed<E>
where
    E: std::error::Error + 'static,
{
    pub attempt_count: u32,
    pub elapsed: Duration,
    pub start_time: DateTime<Utc>,
    pub reason: GiveUpReason,
    #[source]
    pub source: E,
}

/// Error returned by [`Retry`].
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The policy gave up; carries the last failure.
    #[error(transparent)]
    Exhausted(RetryFailed<E>),

    /// The failure was not eligible for retry.
    #[error(transparent)]
    Aborted(E),
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Underlying failure of the last attempt.
    pub fn source_error(&self) -> &E {
        match self {
            Self::Exhausted(failed) => &failed.source,
            Self::Aborted(e) => e,
        }
    }

    /// Number of attempts made before stopping.
    pub fn attempt_count(&self) -> Option<u32> {
        match self {
            Self::Exhausted(failed) => Some(failed.attempt_count),
            Self::Aborted(_) => None,
        }
    }
}

/// Runs an async supplier under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct Retry {
    policy: RetryPolicy,
}

impl Retry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry on every error until the policy gives up.
    pub async fn run<T, E, F, Fut>(&self, supplier: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        self.run_if(|_| true, supplier).await
    }

    /// Retry only errors accepted by `predicate`; others abort immediately.
    pub async fn run_if<T, E, P, F, Fut>(
        &self,
        predicate: P,
        mut supplier: F,
    ) -> Result<T, RetryError<E>>
    where
        P: Fn(&E) -> bool,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let start_time = Utc::now();
        let started = tokio::time::Instant::now();
        let mut attempt_count = 0u32;

        loop {
            attempt_count += 1;
            let error = match supplier().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !predicate(&error) {
                return Err(RetryError::Aborted(error));
            }

            let elapsed = started.elapsed();
            let now = Utc::now();
            match self.policy.decide(attempt_count, elapsed, now, now) {
                RetryDecision::RetryAfter(delay) => {
                    info!(
                        attempt_count,
                        elapsed_ms = elapsed.as_millis() as u64,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying, elapsed {:?} and {} attempts",
                        elapsed,
                        attempt_count
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp(reason) => {
                    warn!(
                        attempt_count,
                        elapsed_ms = elapsed.as_millis() as u64,
                        reason = %reason,
                        error = %error,
                        "Stop retry"
                    );
                    return Err(RetryError::Exhausted(RetryFailed {
                        attempt_count,
                        elapsed,
                        start_time,
                        reason,
                        source: error,
                    }));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Error)]
    #[error("boom {0}")]
    struct Boom(u32);

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempt, Some(3));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(10));
    }

    #[test]
    fn test_constant_decisions() {
        let policy = RetryPolicy::constant(Duration::from_millis(500), 2);
        assert_eq!(
            policy.decide(1, Duration::ZERO, at(0), at(0)),
            RetryDecision::RetryAfter(Duration::from_millis(500))
        );
        assert_eq!(
            policy.decide(2, Duration::ZERO, at(0), at(0)),
            RetryDecision::GiveUp(GiveUpReason::MaxAttempts)
        );
    }

    #[test]
    fn test_decision_counts_time_since_last_failure() {
        let policy = RetryPolicy::constant(Duration::from_secs(5), 10);
        assert_eq!(
            policy.decide(1, Duration::from_secs(3), at(100), at(103)),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(1, Duration::from_secs(9), at(100), at(109)),
            RetryDecision::RetryAfter(Duration::ZERO)
        );
        assert_eq!(policy.next_retry_date(1, Duration::ZERO, at(100)), Some(at(105)));
    }

    #[test]
    fn test_max_duration_gives_up() {
        let mut policy = RetryPolicy::constant(Duration::from_secs(5), 100);
        policy.max_duration_ms = Some(12_000);
        assert!(matches!(
            policy.decide(2, Duration::from_secs(10), at(0), at(0)),
            RetryDecision::GiveUp(GiveUpReason::MaxDuration)
        ));
        assert_eq!(policy.next_retry_date(2, Duration::from_secs(10), at(0)), None);
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());

        let mut unbounded = RetryPolicy::default();
        unbounded.max_attempt = None;
        assert!(unbounded.validate().is_err());

        let shrinking = RetryPolicy::exponential(
            Duration::from_secs(1),
            0.5,
            Duration::from_secs(10),
            3,
        );
        assert!(shrinking.validate().is_err());
    }

    #[test]
    fn test_policy_deserialization() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"type":"exponential","intervalMs":1000,"delayFactor":2.0,"maxIntervalMs":10000,"maxAttempt":3}"#,
        )
        .unwrap();
        assert_eq!(policy, RetryPolicy::default());

        let fixed: RetryPolicy =
            serde_json::from_str(r#"{"type":"fixed","intervalMs":250,"maxAttempt":4}"#).unwrap();
        assert_eq!(fixed, RetryPolicy::constant(Duration::from_millis(250), 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_after_max_attempts() {
        let retry = Retry::new(RetryPolicy::exponential(
            Duration::from_secs(1),
            2.0,
            Duration::from_secs(10),
            3,
        ));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), _> = retry
            .run(|| {
                let counter = counter.clone();
                async move { Err(Boom(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(RetryError::Exhausted(failed)) => {
                assert_eq!(failed.attempt_count, 3);
                assert_eq!(failed.reason, GiveUpReason::MaxAttempts);
                assert_eq!(failed.source.0, 3);
                assert!(failed.to_string().starts_with("Stop retry, attempts 3"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_eventually() {
        let retry = Retry::new(RetryPolicy::constant(Duration::from_millis(100), 5));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = retry
            .run(|| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(Boom(n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(tokio_test::assert_ok!(result), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_predicate_aborts() {
        let retry = Retry::new(RetryPolicy::constant(Duration::from_millis(100), 5));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), _> = retry
            .run_if(
                |e: &Boom| e.0 < 2,
                || {
                    let counter = counter.clone();
                    async move { Err(Boom(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
                },
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Aborted(Boom(2))));
        assert_eq!(err.attempt_count(), None);
    }
}
