//! Error types for guarded execution

use crate::classifier::{ErrorClass, OperationError};
use std::error::Error;
use std::fmt;

/// Terminal outcome of a guarded call that did not produce a value
#[derive(Debug)]
pub enum ExecutionError<E = OperationError> {
    /// Circuit is open, the operation was not attempted
    CircuitOpen { circuit: String },
    /// Every allowed attempt failed with a retryable error
    RetryExhausted {
        attempts: u32,
        class: ErrorClass,
        source: E,
    },
    /// The operation failed with an error that must not be retried
    NonRetryable { class: ErrorClass, source: E },
    /// The call was abandoned while waiting for a permit, a backoff timer or
    /// an in-flight attempt
    Cancelled,
}

impl<E> ExecutionError<E> {
    /// True if the breaker short-circuited the call
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ExecutionError::CircuitOpen { .. })
    }

    /// True if the service was reached but kept failing
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, ExecutionError::RetryExhausted { .. })
    }

    pub fn is_non_retryable(&self) -> bool {
        matches!(self, ExecutionError::NonRetryable { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecutionError::Cancelled)
    }

    /// Classification of the last failure, if an attempt was made
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            ExecutionError::RetryExhausted { class, .. }
            | ExecutionError::NonRetryable { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// The operation's own error, if an attempt was made
    pub fn into_source(self) -> Option<E> {
        match self {
            ExecutionError::RetryExhausted { source, .. }
            | ExecutionError::NonRetryable { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for ExecutionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionError::CircuitOpen { circuit } => {
                write!(f, "Circuit '{}' is open, call rejected", circuit)
            }
            ExecutionError::RetryExhausted {
                attempts, source, ..
            } => {
                write!(f, "Gave up after {} attempts: {}", attempts, source)
            }
            ExecutionError::NonRetryable { class, source } => {
                write!(f, "Non-retryable failure ({}): {}", class.label(), source)
            }
            ExecutionError::Cancelled => write!(f, "Call cancelled"),
        }
    }
}

impl<E: Error + 'static> Error for ExecutionError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ExecutionError::RetryExhausted { source, .. }
            | ExecutionError::NonRetryable { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// A wait on the rate limiter or a backoff timer was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait cancelled")]
pub struct Cancelled;

impl<E> From<Cancelled> for ExecutionError<E> {
    fn from(_: Cancelled) -> Self {
        ExecutionError::Cancelled
    }
}

/// Rejected configuration values
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("permits per second must be positive")]
    ZeroCapacity,
    #[error("failure threshold must be positive")]
    ZeroFailureThreshold,
    #[error("base delay must be positive")]
    ZeroBaseDelay,
    #[error("backoff multiplier must be greater than 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("max delay ({max_ms} ms) must not be below base delay ({base_ms} ms)")]
    MaxDelayBelowBase { base_ms: u128, max_ms: u128 },
    #[error("jitter factor must be within 0.0..=1.0 (got {0})")]
    InvalidJitter(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_circuit() {
        let err: ExecutionError = ExecutionError::CircuitOpen {
            circuit: "libretranslate".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Circuit 'libretranslate' is open, call rejected"
        );
        assert!(err.is_circuit_open());
        assert!(err.class().is_none());
    }

    #[test]
    fn test_source_chain_exposes_operation_error() {
        let err: ExecutionError = ExecutionError::RetryExhausted {
            attempts: 3,
            class: ErrorClass::RetryableStatus(503),
            source: OperationError::Status {
                code: 503,
                message: "busy".into(),
            },
        };

        assert!(err.is_retry_exhausted());
        assert_eq!(err.class(), Some(ErrorClass::RetryableStatus(503)));
        let source = err.source().expect("source should be set");
        assert_eq!(source.to_string(), "remote returned status 503: busy");
        assert!(err.to_string().starts_with("Gave up after 3 attempts"));
    }

    #[test]
    fn test_cancelled_converts() {
        let err: ExecutionError<OperationError> = Cancelled.into();
        assert!(err.is_cancelled());
        assert!(err.into_source().is_none());
    }
}
