//! Bounded retry with exponential back-off.
//!
//! The wait before retry `n` is `base * factor^n`, truncated to the policy
//! granularity. Back-off state lives only for one logical operation; every
//! call to [`retry_with_backoff`] starts again at attempt zero.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Error returned by [`retry_with_backoff`].
#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    /// Every attempt failed with a retryable error.
    #[error("Gave up after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },
    /// A non-retryable error ended the operation early.
    #[error(transparent)]
    Aborted(E),
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// The underlying error of the last attempt.
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Aborted(e) => e,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Retry limits and back-off growth for one logical operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Wait before the first retry is `base_delay * growth_factor`.
    pub base_delay: Duration,
    pub growth_factor: f64,
    /// Computed waits are truncated to a multiple of this.
    pub granularity: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 40,
            base_delay: Duration::from_secs(1),
            growth_factor: 1.2,
            granularity: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, growth_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            growth_factor,
            ..Default::default()
        }
    }

    /// Set the truncation granularity of computed waits.
    pub fn with_granularity(mut self, granularity: Duration) -> Self {
        self.granularity = granularity;
        self
    }

    /// Wait applied after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.growth_factor.powi(exponent);
        if !raw.is_finite() || raw <= 0.0 {
            return Duration::ZERO;
        }

        let step = self.granularity.as_secs_f64();
        if step <= 0.0 {
            return Duration::try_from_secs_f64(raw).unwrap_or(Duration::MAX);
        }

        let steps = (raw / step).floor();
        Duration::try_from_secs_f64(steps * step).unwrap_or(Duration::MAX)
    }

    /// Sum of all waits when every attempt fails.
    pub fn worst_case_wait(&self) -> Duration {
        (1..self.max_attempts)
            .map(|attempt| self.delay_for(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Source of delays, replaceable in tests.
pub trait Clock: Send + Sync {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// `label` names the operation in log messages.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    clock: &C,
    label: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + Retryable + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Clock,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(RetryError::Aborted(e)),
            Err(e) => e,
        };

        attempt += 1;
        if attempt >= max_attempts {
            warn!(
                operation = %label,
                attempts = attempt,
                error = %err,
                "Retries exhausted"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                source: err,
            });
        }

        let wait = policy.delay_for(attempt);
        warn!(
            operation = %label,
            attempt,
            wait_secs = wait.as_secs_f64(),
            error = %err,
            "Request failed, retrying with backoff"
        );
        clock.sleep(wait).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Clock that records requested sleeps and returns immediately.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingClock {
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl RecordingClock {
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps.lock().clone()
        }
    }

    impl Clock for RecordingClock {
        async fn sleep(&self, duration: Duration) {
            self.sleeps.lock().push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingClock;
    use super::*;

    #[derive(Debug, Error)]
    enum TestError {
        #[error("transient")]
        Transient,
        #[error("fatal")]
        Fatal,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 40);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.growth_factor, 1.2);
    }

    #[test]
    fn test_delay_sequence_whole_seconds() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(6));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1469));
    }

    #[test]
    fn test_delay_is_non_decreasing() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (1..=40).map(|a| policy.delay_for(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_delay_with_millisecond_granularity() {
        let policy = RetryPolicy::new(5, Duration::from_millis(10), 2.0)
            .with_granularity(Duration::from_millis(1));

        assert_eq!(policy.delay_for(1), Duration::from_millis(20));
        assert_eq!(policy.delay_for(3), Duration::from_millis(80));
    }

    #[test]
    fn test_worst_case_wait() {
        let policy = RetryPolicy::new(4, Duration::from_secs(1), 2.0);
        // waits after attempts 1, 2, 3: 2 + 4 + 8
        assert_eq!(policy.worst_case_wait(), Duration::from_secs(14));
    }

    #[tokio::test]
    async fn test_success_first_try_does_not_sleep() {
        let clock = RecordingClock::default();
        let result: Result<u32, RetryError<TestError>> =
            retry_with_backoff(&RetryPolicy::default(), &clock, "test", || async { Ok(7) })
                .await;

        assert_eq!(result.unwrap(), 7);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let clock = RecordingClock::default();
        let mut calls = 0;

        let result = retry_with_backoff(&RetryPolicy::default(), &clock, "test", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 4 {
                    Err(TestError::Transient)
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1)
            ]
        );
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let clock = RecordingClock::default();
        let policy = RetryPolicy::new(5, Duration::from_secs(1), 1.2);
        let mut calls = 0;

        let result: Result<(), _> = retry_with_backoff(&policy, &clock, "test", || {
            calls += 1;
            async { Err(TestError::Transient) }
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            RetryError::Exhausted {
                attempts: 5,
                source: TestError::Transient
            }
        ));
        assert_eq!(calls, 5);
        // no sleep after the final attempt
        assert_eq!(clock.sleeps().len(), 4);
    }

    #[tokio::test]
    async fn test_full_budget_waits() {
        let clock = RecordingClock::default();
        let policy = RetryPolicy::default();

        let result: Result<(), _> =
            retry_with_backoff(&policy, &clock, "test", || async { Err(TestError::Transient) })
                .await;

        assert!(result.unwrap_err().is_exhausted());
        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 39);
        assert_eq!(sleeps.last(), Some(&Duration::from_secs(1224)));
        assert_eq!(
            sleeps.iter().copied().fold(Duration::ZERO, Duration::saturating_add),
            policy.worst_case_wait()
        );
    }

    #[tokio::test]
    async fn test_non_retryable_error_aborts_immediately() {
        let clock = RecordingClock::default();
        let mut calls = 0;

        let result: Result<(), _> = retry_with_backoff(&RetryPolicy::default(), &clock, "test", || {
            calls += 1;
            async { Err(TestError::Fatal) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Aborted(TestError::Fatal))));
        assert_eq!(calls, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_each_call_starts_at_attempt_zero() {
        let clock = RecordingClock::default();
        let policy = RetryPolicy::new(3, Duration::from_secs(1), 2.0);

        for _ in 0..2 {
            let _: Result<(), _> =
                retry_with_backoff(&policy, &clock, "test", || async { Err(TestError::Transient) })
                    .await;
        }

        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }
}
