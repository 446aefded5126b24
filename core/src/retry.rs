//! Retry policy and the blocking execution loop

use crate::classifier::{FailureClassifier, StatusClassifier};
use crate::errors::{Cancelled, ConfigError, ExecutionError};
use crate::guard::{Guard, Verdict};
use crate::rate_limiter::CANCEL_POLL;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How failed attempts are retried
///
/// Immutable once built; cloning shares the classifier.
pub struct RetryPolicy<C = StatusClassifier> {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter_factor: f64,
    classifier: Arc<C>,
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// A single attempt, failures are surfaced without backoff
    pub fn disabled() -> Self {
        Self::default().without_retries()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(30_000),
            jitter_factor: 0.0,
            classifier: Arc::new(StatusClassifier::default()),
        }
    }
}

impl<C> RetryPolicy<C> {
    /// Configured attempt budget, 0 meaning "retries disabled"
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Number of times the operation may run; never below one
    pub fn effective_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Same policy limited to a single attempt
    pub fn without_retries(mut self) -> Self {
        self.max_attempts = 1;
        self
    }

    /// Same timings, different classifier
    pub fn with_classifier<D>(self, classifier: D) -> RetryPolicy<D> {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            multiplier: self.multiplier,
            max_delay: self.max_delay,
            jitter_factor: self.jitter_factor,
            classifier: Arc::new(classifier),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay.is_zero() {
            return Err(ConfigError::ZeroBaseDelay);
        }
        if !(self.multiplier > 1.0) || !self.multiplier.is_finite() {
            return Err(ConfigError::InvalidMultiplier(self.multiplier));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::MaxDelayBelowBase {
                base_ms: self.base_delay.as_millis(),
                max_ms: self.max_delay.as_millis(),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidJitter(self.jitter_factor));
        }
        Ok(())
    }

    /// Un-jittered delay before the attempt following `attempt` (1-based):
    /// `min(base_delay * multiplier^(attempt - 1), max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let nanos = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);

        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        if nanos < u64::MAX as f64 {
            return Duration::from_nanos(nanos.round() as u64);
        }
        Duration::try_from_secs_f64(nanos / 1e9).unwrap_or(self.max_delay)
    }

    /// Delay actually slept, with jitter applied when configured
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }

        // The formula is unit-agnostic; microseconds keep sub-millisecond delays
        let delay_us = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: delay_us,
            multiplier: 1.0,
            max_delay_ms: delay_us,
        };
        Duration::from_micros(policy.calculate_delay(1, self.jitter_factor))
    }
}

impl<C> Clone for RetryPolicy<C> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            multiplier: self.multiplier,
            max_delay: self.max_delay,
            jitter_factor: self.jitter_factor,
            classifier: Arc::clone(&self.classifier),
        }
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for RetryPolicy<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .field("jitter_factor", &self.jitter_factor)
            .field("classifier", &self.classifier)
            .finish()
    }
}

/// Builder for [`RetryPolicy`] with validation on `build()`
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter_factor: f64,
    classifier: StatusClassifier,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay: defaults.base_delay,
            multiplier: defaults.multiplier,
            max_delay: defaults.max_delay,
            jitter_factor: defaults.jitter_factor,
            classifier: StatusClassifier::default(),
        }
    }
}

impl RetryPolicyBuilder {
    /// Total attempts including the first; 0 disables retries
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Jitter factor (0.0 = no jitter, 1.0 = full jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Replace the default retryable status set (429, 500, 502, 503)
    pub fn retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.classifier = StatusClassifier::new(statuses);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        let policy = RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            multiplier: self.multiplier,
            max_delay: self.max_delay,
            jitter_factor: self.jitter_factor,
            classifier: Arc::new(self.classifier),
        };
        policy.validate()?;
        Ok(policy)
    }
}

impl Guard {
    /// Run `operation` on the calling thread under the guard's default policy
    ///
    /// Blocks while waiting for a rate limiter permit and while backing off.
    /// Unwinds with [`ExecutionError::Cancelled`] if the guard is shut down.
    pub fn execute<T, E, F>(&self, operation: F) -> Result<T, ExecutionError<E>>
    where
        F: FnMut() -> Result<T, E>,
        StatusClassifier: FailureClassifier<E>,
    {
        let cancel = self.cancellation_token();
        let policy = self.policy().clone();
        self.execute_with(&policy, &cancel, operation)
    }

    /// Run `operation` on the calling thread under `policy`
    ///
    /// For attempt `1..=max_attempts`: fail fast if the circuit is open, take
    /// a permit, run the operation, then either return, surface a terminal
    /// error, or sleep the backoff delay and go again. The circuit hears about
    /// the call's final outcome only. `cancel` should come from
    /// [`Guard::cancellation_token`] so a shutdown also interrupts the call.
    pub fn execute_with<T, E, C, F>(
        &self,
        policy: &RetryPolicy<C>,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnMut() -> Result<T, E>,
        C: FailureClassifier<E>,
    {
        let inner = self.inner();
        let attempts = policy.effective_attempts();
        let mut attempt = 1;

        loop {
            if inner.is_cancelled(cancel) {
                return Err(ExecutionError::Cancelled);
            }
            if inner.rejects_call() {
                return Err(inner.rejection());
            }

            inner.limiter.acquire(cancel)?;

            let started = Instant::now();
            match operation() {
                Ok(value) => {
                    inner.on_success(started.elapsed());
                    return Ok(value);
                }
                Err(error) => {
                    match inner.settle(policy, attempt, attempts, error, started.elapsed()) {
                        Verdict::Retry(delay) => {
                            sleep_cancellable(delay, cancel)?;
                            attempt += 1;
                        }
                        Verdict::Fail(err) => return Err(err),
                    }
                }
            }
        }
    }
}

/// Sleep in short slices so cancellation is noticed promptly
///
/// A delay past the end of the clock's range only ends on cancellation.
fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
    let deadline = Instant::now().checked_add(delay);

    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                (deadline - now).min(CANCEL_POLL)
            }
            None => CANCEL_POLL,
        };
        std::thread::sleep(slice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ErrorClass, OperationError, PredicateClassifier};
    use crate::circuit::BreakerState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(1))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(5))
            .build()
            .unwrap()
    }

    fn guard(threshold: u32) -> Guard {
        Guard::builder("test")
            .permits_per_second(1000)
            .failure_threshold(threshold)
            .reset_timeout(Duration::from_secs(30))
            .retry_policy(fast_policy(3))
            .build()
            .unwrap()
    }

    fn unavailable() -> OperationError {
        OperationError::Status {
            code: 503,
            message: "service unavailable".into(),
        }
    }

    #[test]
    fn test_backoff_sequence_is_capped() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(1000))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(30_000))
            .build()
            .unwrap();

        let delays: Vec<u128> = (1..=8).map(|n| policy.delay_for(n).as_millis()).collect();
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000, 30_000]
        );
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jittered_backoff_stays_within_bounds() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(1000))
            .jitter_factor(0.5)
            .build()
            .unwrap();

        for _ in 0..20 {
            let delay = policy.backoff(2);
            assert!(delay <= Duration::from_millis(200));
            assert!(delay >= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_jitter_keeps_sub_millisecond_delays() {
        let policy = RetryPolicy::builder()
            .base_delay(Duration::from_micros(300))
            .max_delay(Duration::from_micros(300))
            .jitter_factor(0.5)
            .build()
            .unwrap();

        for _ in 0..20 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_micros(150));
            assert!(delay <= Duration::from_micros(300));
        }
    }

    #[test]
    fn test_builder_validation() {
        assert_eq!(
            RetryPolicy::builder().base_delay(Duration::ZERO).build().unwrap_err(),
            ConfigError::ZeroBaseDelay
        );
        assert!(matches!(
            RetryPolicy::builder().multiplier(1.0).build(),
            Err(ConfigError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            RetryPolicy::builder()
                .base_delay(Duration::from_secs(2))
                .max_delay(Duration::from_secs(1))
                .build(),
            Err(ConfigError::MaxDelayBelowBase { .. })
        ));
        assert!(RetryPolicy::builder().max_attempts(0).build().is_ok());
    }

    #[test]
    fn test_retryable_failure_runs_exactly_max_attempts() {
        let guard = guard(10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guard.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        });

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(ExecutionError::RetryExhausted {
                attempts, class, ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(class, ErrorClass::RetryableStatus(503));
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }

        // Exhaustion counts as one failure for the circuit, not three
        assert_eq!(guard.breaker().snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_non_retryable_failure_runs_once() {
        let guard = guard(10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guard.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(OperationError::Status {
                code: 400,
                message: "unsupported language".into(),
            })
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_non_retryable());
        assert_eq!(guard.breaker().snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let guard = guard(10);
        let calls = AtomicU32::new(0);

        let result = guard.execute(|| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(OperationError::Transport("connection reset".into()))
            } else {
                Ok("hola")
            }
        });

        assert_eq!(result.unwrap(), "hola");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(guard.breaker().snapshot().consecutive_failures, 0);

        let metrics = guard.stats().metrics;
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.error_counts.get("transport"), Some(&2));
    }

    #[test]
    fn test_open_circuit_fails_fast_without_invoking() {
        let guard = Guard::builder("test")
            .failure_threshold(5)
            .reset_timeout(Duration::from_secs(30))
            .retry_policy(fast_policy(1))
            .build()
            .unwrap();

        for _ in 0..5 {
            let _ = guard.execute(|| Err::<(), _>(unavailable()));
        }
        assert_eq!(guard.breaker().state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let result = guard.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OperationError>(())
        });

        assert!(result.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Rejection is not recorded as another failure
        assert_eq!(guard.breaker().snapshot().consecutive_failures, 5);
        assert_eq!(guard.stats().metrics.rejections, 1);
    }

    #[test]
    fn test_zero_attempts_means_single_try() {
        let guard = guard(10);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = guard.execute_with(
            &fast_policy(0),
            &guard.cancellation_token(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            },
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_retry_exhausted());
    }

    #[test]
    fn test_custom_classifier() {
        let guard = guard(10);
        let policy = fast_policy(4).with_classifier(PredicateClassifier::<String, _>::new(
            |ctx| {
                if ctx.error.contains("busy") {
                    ErrorClass::RetryableTransport
                } else {
                    ErrorClass::NonRetryable
                }
            },
        ));
        let calls = AtomicU32::new(0);

        let result: Result<(), ExecutionError<String>> =
            guard.execute_with(&policy, &guard.cancellation_token(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("server busy".to_string())
            });

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.unwrap_err().into_source().as_deref(), Some("server busy"));
    }

    #[test]
    fn test_backoff_sleep_is_cancellable() {
        let guard = guard(10);
        let policy = RetryPolicy::builder()
            .max_attempts(5)
            .base_delay(Duration::from_secs(10))
            .max_delay(Duration::from_secs(10))
            .build()
            .unwrap();
        let cancel = guard.cancellation_token();
        let canceller = cancel.clone();
        let calls = AtomicU32::new(0);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> = guard.execute_with(&policy, &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        });

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(2));
        // Cancellation is not an outcome the circuit hears about
        assert_eq!(guard.breaker().snapshot().consecutive_failures, 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_huge_backoff_waits_for_cancel() {
        let guard = guard(10);
        let policy = RetryPolicy::builder()
            .max_attempts(2)
            .base_delay(Duration::from_secs(u64::MAX))
            .max_delay(Duration::MAX)
            .build()
            .unwrap();
        let cancel = guard.cancellation_token();
        let canceller = cancel.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let start = Instant::now();
        let result: Result<(), _> =
            guard.execute_with(&policy, &cancel, || Err(unavailable()));

        assert!(result.unwrap_err().is_cancelled());
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_operation_reported_cancel() {
        let guard = guard(10);

        let result: Result<(), _> = guard.execute(|| Err(OperationError::Cancelled));

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(guard.breaker().snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_shutdown_rejects_new_calls() {
        let guard = guard(10);
        guard.shutdown();

        let calls = AtomicU32::new(0);
        let result = guard.execute(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, OperationError>(())
        });

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
