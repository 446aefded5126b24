//! Builder API for guard configuration

use crate::{
    callbacks::{Callbacks, Transition},
    circuit::{CircuitBreaker, CircuitConfig},
    errors::ConfigError,
    guard::{Guard, GuardInner},
    metrics::{MemoryMetrics, MetricsSink},
    rate_limiter::{RateLimiter, RateLimiterConfig},
    registry::Registry,
    retry::{RetryPolicy, RetryPolicyBuilder},
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Builder for creating guards with fluent API
///
/// Nothing is validated until [`GuardBuilder::build`].
pub struct GuardBuilder {
    name: String,
    limiter: RateLimiterConfig,
    circuit: CircuitConfig,
    retry: RetryPolicyBuilder,
    policy: Option<RetryPolicy>,
    retry_enabled: bool,
    metrics: Option<Arc<dyn MetricsSink>>,
    callbacks: Callbacks,
    registry: Option<Arc<Registry>>,
}

impl GuardBuilder {
    /// Create a new builder for a guard with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limiter: RateLimiterConfig::default(),
            circuit: CircuitConfig::default(),
            retry: RetryPolicy::builder(),
            policy: None,
            retry_enabled: true,
            metrics: None,
            callbacks: Callbacks::new(),
            registry: None,
        }
    }

    /// Bucket capacity and refill rate
    pub fn permits_per_second(mut self, permits: u64) -> Self {
        self.limiter.permits_per_second = permits;
        self
    }

    /// Longest single wait of a caller blocked on the limiter
    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.limiter.cooldown = cooldown;
        self
    }

    /// Consecutive failed calls that open the circuit
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.circuit.failure_threshold = threshold;
        self
    }

    /// Time the circuit stays open before a probe is let through
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.circuit.reset_timeout = timeout;
        self
    }

    /// Set the jitter factor for the reset timeout (0.0 = no jitter, 1.0 = full jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.circuit.jitter_factor = factor;
        self
    }

    /// Total attempts per call, including the first
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.retry = self.retry.max_attempts(attempts);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.retry = self.retry.base_delay(delay);
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.retry = self.retry.multiplier(multiplier);
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.retry = self.retry.max_delay(delay);
        self
    }

    /// Jitter factor applied to backoff delays
    pub fn retry_jitter(mut self, factor: f64) -> Self {
        self.retry = self.retry.jitter_factor(factor);
        self
    }

    /// HTTP statuses worth retrying (default 429, 500, 502, 503)
    pub fn retryable_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.retry = self.retry.retryable_statuses(statuses);
        self
    }

    /// Use a prebuilt default policy instead of the individual retry settings
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// With retries disabled every call gets exactly one attempt
    pub fn retry_enabled(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    /// Set custom metrics sink (defaults to [`MemoryMetrics`])
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open state
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Track the built guard in `registry` so it can be shut down with the rest
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration and build the guard
    pub fn build(self) -> Result<Guard, ConfigError> {
        let policy = match self.policy {
            Some(policy) => policy,
            None => self.retry.build()?,
        };
        let policy = if self.retry_enabled {
            policy
        } else {
            policy.without_retries()
        };

        let limiter = RateLimiter::new(self.limiter)?;
        let breaker = CircuitBreaker::with_callbacks(&self.name, self.circuit, self.callbacks)?;
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MemoryMetrics::new()));

        info!(
            circuit = %self.name,
            permits_per_second = limiter.stats().capacity,
            failure_threshold = breaker.config().failure_threshold,
            max_attempts = policy.effective_attempts(),
            "Guard created"
        );

        let guard = Guard::from_parts(GuardInner {
            name: self.name,
            limiter,
            breaker,
            policy,
            metrics,
            shutdown: CancellationToken::new(),
        });

        if let Some(registry) = self.registry {
            guard.register(&registry);
        }
        Ok(guard)
    }
}

impl std::fmt::Debug for GuardBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardBuilder")
            .field("name", &self.name)
            .field("limiter", &self.limiter)
            .field("circuit", &self.circuit)
            .field("retry", &self.retry)
            .field("retry_enabled", &self.retry_enabled)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::BreakerState;
    use crate::classifier::OperationError;
    use std::sync::Mutex;

    #[test]
    fn test_builder_defaults() {
        let guard = GuardBuilder::new("translate").build().unwrap();

        assert_eq!(guard.name(), "translate");
        assert_eq!(guard.stats().limiter.capacity, 10);
        assert_eq!(guard.breaker().config().failure_threshold, 5);
        assert_eq!(guard.breaker().config().reset_timeout, Duration::from_secs(30));
        assert_eq!(guard.policy().max_attempts(), 3);
        assert_eq!(guard.policy().base_delay(), Duration::from_millis(1000));
        assert_eq!(guard.policy().max_delay(), Duration::from_millis(30_000));
        assert!(guard.breaker().is_closed());
    }

    #[test]
    fn test_builder_custom_config() {
        let guard = GuardBuilder::new("translate")
            .permits_per_second(3)
            .failure_threshold(2)
            .reset_timeout(Duration::from_secs(5))
            .max_attempts(6)
            .base_delay(Duration::from_millis(10))
            .multiplier(3.0)
            .max_delay(Duration::from_millis(100))
            .build()
            .unwrap();

        assert_eq!(guard.stats().limiter.capacity, 3);
        assert_eq!(guard.breaker().config().failure_threshold, 2);
        assert_eq!(guard.policy().max_attempts(), 6);
        assert_eq!(guard.policy().delay_for(2), Duration::from_millis(30));
        assert_eq!(guard.policy().delay_for(3), Duration::from_millis(90));
        assert_eq!(guard.policy().delay_for(4), Duration::from_millis(100));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        assert_eq!(
            GuardBuilder::new("a").permits_per_second(0).build().unwrap_err(),
            ConfigError::ZeroCapacity
        );
        assert_eq!(
            GuardBuilder::new("a").failure_threshold(0).build().unwrap_err(),
            ConfigError::ZeroFailureThreshold
        );
        assert!(matches!(
            GuardBuilder::new("a").multiplier(0.5).build(),
            Err(ConfigError::InvalidMultiplier(_))
        ));
    }

    #[test]
    fn test_retry_disabled() {
        let guard = GuardBuilder::new("translate")
            .max_attempts(5)
            .retry_enabled(false)
            .build()
            .unwrap();

        assert_eq!(guard.policy().max_attempts(), 1);
    }

    #[test]
    fn test_builder_with_callbacks() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let opened = Arc::clone(&transitions);

        let guard = GuardBuilder::new("translate")
            .failure_threshold(1)
            .retry_enabled(false)
            .on_open(move |t| opened.lock().unwrap().push((t.from, t.to)))
            .build()
            .unwrap();

        let _ = guard.execute(|| Err::<(), _>(OperationError::Transport("refused".into())));

        assert_eq!(
            *transitions.lock().unwrap(),
            vec![(BreakerState::Closed, BreakerState::Open)]
        );
    }

    #[test]
    fn test_builder_registers_guard() {
        let registry = Arc::new(Registry::new());
        let guard = GuardBuilder::new("translate")
            .registry(Arc::clone(&registry))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 1);
        registry.shutdown_all();
        assert!(guard.is_shut_down());
    }
}
