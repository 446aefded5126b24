//! Guard - the resilient client shared by every call to one service

use crate::builder::GuardBuilder;
use crate::circuit::{CircuitBreaker, CircuitSnapshot};
use crate::classifier::{ErrorClass, FailureClassifier, FailureContext};
use crate::errors::{ConfigError, ExecutionError};
use crate::metrics::{MetricsSink, MetricsSnapshot};
use crate::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::registry::{Lifecycle, RegistrationId, Registry};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Rate limiter, circuit breaker, and default retry policy bundled for one
/// remote service
///
/// Cloning is cheap and every clone shares the same limiter and circuit, so a
/// guard can be handed to as many threads or tasks as needed.
#[derive(Debug, Clone)]
pub struct Guard {
    inner: Arc<GuardInner>,
}

/// Point-in-time view of a guard
#[derive(Debug, Clone)]
pub struct GuardStats {
    pub limiter: RateLimiterStats,
    pub circuit: CircuitSnapshot,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug)]
pub(crate) struct GuardInner {
    pub(crate) name: String,
    pub(crate) limiter: RateLimiter,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) policy: RetryPolicy,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) shutdown: CancellationToken,
}

/// What the loop does after a failed attempt
pub(crate) enum Verdict<E> {
    Retry(Duration),
    Fail(ExecutionError<E>),
}

impl Guard {
    pub fn builder(name: impl Into<String>) -> GuardBuilder {
        GuardBuilder::new(name)
    }

    pub(crate) fn from_parts(inner: GuardInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<GuardInner> {
        &self.inner
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Policy used by [`Guard::execute`] and [`Guard::execute_async`]
    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.inner.metrics
    }

    /// Token for a single call; cancelled on its own or when the guard shuts down
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Change the limiter's rate and cooldown; waiting callers see it immediately
    pub fn reconfigure_limiter(
        &self,
        permits_per_second: u64,
        cooldown: Duration,
    ) -> Result<(), ConfigError> {
        self.inner.limiter.update(permits_per_second, cooldown)
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats {
            limiter: self.inner.limiter.stats(),
            circuit: self.inner.breaker.snapshot(),
            metrics: self.inner.metrics.snapshot(&self.inner.name),
        }
    }

    /// Cancel every in-flight call and reject new ones
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }

    /// Track this guard in `registry` without keeping it alive
    pub fn register(&self, registry: &Registry) -> RegistrationId {
        registry.register(&self.inner)
    }
}

impl GuardInner {
    pub(crate) fn is_cancelled(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.shutdown.is_cancelled()
    }

    /// Ask the circuit whether this attempt must be short-circuited
    pub(crate) fn rejects_call(&self) -> bool {
        if !self.breaker.is_open() {
            return false;
        }
        self.metrics.record_rejection(&self.name);
        warn!(circuit = %self.name, "Circuit open, rejecting call");
        true
    }

    pub(crate) fn rejection<E>(&self) -> ExecutionError<E> {
        ExecutionError::CircuitOpen {
            circuit: self.name.clone(),
        }
    }

    pub(crate) fn on_success(&self, latency: Duration) {
        self.breaker.record_success();
        self.metrics.record_success(&self.name, latency);
    }

    /// Classify a failed attempt and decide between retrying and giving up
    ///
    /// Terminal outcomes are reported to the circuit exactly once per call;
    /// cancellation is not reported at all.
    pub(crate) fn settle<E, C>(
        &self,
        policy: &RetryPolicy<C>,
        attempt: u32,
        attempts: u32,
        error: E,
        latency: Duration,
    ) -> Verdict<E>
    where
        C: FailureClassifier<E>,
    {
        let class = policy.classifier().classify(&FailureContext {
            circuit_name: &self.name,
            error: &error,
            attempt,
            elapsed: latency,
        });
        self.metrics
            .record_failure(&self.name, &class.label(), latency);

        match class {
            ErrorClass::Cancelled => {
                debug!(circuit = %self.name, attempt, "Operation reported cancellation");
                Verdict::Fail(ExecutionError::Cancelled)
            }
            ErrorClass::NonRetryable => {
                self.breaker.record_failure();
                error!(circuit = %self.name, attempt, "Non-retryable failure");
                Verdict::Fail(ExecutionError::NonRetryable {
                    class,
                    source: error,
                })
            }
            _ if attempt >= attempts => {
                self.breaker.record_failure();
                error!(
                    circuit = %self.name,
                    attempts = attempt,
                    error_type = %class.label(),
                    "All {} attempts failed",
                    attempt
                );
                Verdict::Fail(ExecutionError::RetryExhausted {
                    attempts: attempt,
                    class,
                    source: error,
                })
            }
            _ => {
                let delay = policy.backoff(attempt);
                self.metrics.record_retry(&self.name, attempt, delay);
                warn!(
                    circuit = %self.name,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error_type = %class.label(),
                    "Retry attempt {}/{} after {}ms",
                    attempt,
                    attempts,
                    delay.as_millis()
                );
                Verdict::Retry(delay)
            }
        }
    }
}

impl Lifecycle for Guard {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl Lifecycle for GuardInner {
    fn name(&self) -> &str {
        &self.name
    }

    fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(circuit = %self.name, "Shutting down guard");
            self.shutdown.cancel();
        }
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
