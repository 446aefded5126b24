//! translate-guard - resilient calls to a remote translation API
//!
//! A [`Guard`] wraps every call to one remote service with:
//! - A token-bucket rate limiter with lazy refill and reconfigurable rate
//! - A circuit breaker state machine (Closed → Open → HalfOpen)
//! - Exponential-backoff retries driven by a pluggable failure classifier
//! - Cancellation through `tokio_util` tokens, for blocking and async callers
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use translate_guard::{Guard, OperationError};
//!
//! let guard = Guard::builder("translate_api")
//!     .permits_per_second(20)
//!     .failure_threshold(5)
//!     .reset_timeout(Duration::from_secs(30))
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(10))
//!     .on_open(|t| println!("Circuit {} opened!", t.circuit))
//!     .build()
//!     .expect("valid configuration");
//!
//! let result = guard.execute(|| {
//!     // Your translation request here
//!     Ok::<_, OperationError>("Hallo Welt")
//! });
//! assert_eq!(result.unwrap(), "Hallo Welt");
//!
//! if guard.breaker().is_open() {
//!     println!("Circuit is open, skipping call");
//! }
//! ```

pub mod async_exec;
pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod errors;
pub mod guard;
pub mod metrics;
pub mod rate_limiter;
pub mod registry;
pub mod retry;

pub use async_exec::CallHandle;
pub use builder::GuardBuilder;
pub use callbacks::{Callbacks, Transition};
pub use circuit::{BreakerState, CircuitBreaker, CircuitConfig, CircuitSnapshot};
pub use classifier::{
    ErrorClass, FailureClassifier, FailureContext, OperationError, PredicateClassifier,
    RemoteFailure, StatusClassifier,
};
pub use errors::{Cancelled, ConfigError, ExecutionError};
pub use guard::{Guard, GuardStats};
pub use metrics::{MemoryMetrics, MetricsSink, MetricsSnapshot, NullMetrics};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use registry::{Lifecycle, RegistrationId, Registry};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use tokio_util::sync::CancellationToken;

/// Kind of event recorded by a metrics sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Success,
    Failure,
    Retry,
    Rejected,
}

/// A single event recorded by a metrics sink
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    /// Seconds since the sink was created
    pub timestamp: f64,
    /// Latency for attempts, backoff delay for retries
    pub duration: f64,
}
