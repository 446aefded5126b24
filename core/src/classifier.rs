//! Failure classification for retry decisions
//!
//! A failed attempt is tagged once with an [`ErrorClass`]. The retry loop
//! trusts that verdict: retryable classes are backed off and re-attempted,
//! everything else ends the call.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::time::Duration;

/// Statuses retried by [`StatusClassifier::default`]: rate limited,
/// internal error, bad gateway, unavailable
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 4] = [429, 500, 502, 503];

/// Classification of a single failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Network-level fault (connect, reset, timeout)
    RetryableTransport,
    /// Remote answered with a status worth retrying
    RetryableStatus(u16),
    /// Permanent fault, retrying cannot help
    NonRetryable,
    /// The operation itself observed cancellation
    Cancelled,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::RetryableTransport | ErrorClass::RetryableStatus(_)
        )
    }

    /// Stable label used as the metrics key for this class
    pub fn label(&self) -> Cow<'static, str> {
        match self {
            ErrorClass::RetryableTransport => Cow::Borrowed("transport"),
            ErrorClass::RetryableStatus(code) => Cow::Owned(format!("http_{}", code)),
            ErrorClass::NonRetryable => Cow::Borrowed("non_retryable"),
            ErrorClass::Cancelled => Cow::Borrowed("cancelled"),
        }
    }
}

/// What a transport error exposes to the default classifier
pub trait RemoteFailure {
    /// Status code returned by the remote, if it answered
    fn status(&self) -> Option<u16>;

    /// True for faults below the protocol level (I/O, timeouts)
    fn is_transport(&self) -> bool;

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Context handed to a classifier for one failed attempt
#[derive(Debug)]
pub struct FailureContext<'a, E> {
    /// Name of the guard running the call
    pub circuit_name: &'a str,
    /// The error returned by the operation
    pub error: &'a E,
    /// 1-based attempt number
    pub attempt: u32,
    /// Time spent inside the operation
    pub elapsed: Duration,
}

/// Decides how a failed attempt is treated
///
/// # Examples
///
/// ```rust
/// use translate_guard::{ErrorClass, FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct NeverRetry;
///
/// impl<E> FailureClassifier<E> for NeverRetry {
///     fn classify(&self, _ctx: &FailureContext<'_, E>) -> ErrorClass {
///         ErrorClass::NonRetryable
///     }
/// }
/// ```
pub trait FailureClassifier<E>: Send + Sync + std::fmt::Debug {
    fn classify(&self, ctx: &FailureContext<'_, E>) -> ErrorClass;
}

/// Default classifier for errors implementing [`RemoteFailure`]
///
/// Transport faults are always retryable; a status is retryable when it is in
/// the configured set.
#[derive(Debug, Clone)]
pub struct StatusClassifier {
    retryable: BTreeSet<u16>,
}

impl StatusClassifier {
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            retryable: statuses.into_iter().collect(),
        }
    }

    pub fn is_retryable_status(&self, code: u16) -> bool {
        self.retryable.contains(&code)
    }
}

impl Default for StatusClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_RETRYABLE_STATUSES)
    }
}

impl<E: RemoteFailure> FailureClassifier<E> for StatusClassifier {
    fn classify(&self, ctx: &FailureContext<'_, E>) -> ErrorClass {
        let error = ctx.error;
        if error.is_cancelled() {
            return ErrorClass::Cancelled;
        }
        if error.is_transport() {
            return ErrorClass::RetryableTransport;
        }
        match error.status() {
            Some(code) if self.is_retryable_status(code) => ErrorClass::RetryableStatus(code),
            _ => ErrorClass::NonRetryable,
        }
    }
}

/// Predicate-based classifier using a closure
pub struct PredicateClassifier<E, F> {
    predicate: F,
    _error: PhantomData<fn(&E)>,
}

impl<E, F> PredicateClassifier<E, F>
where
    F: Fn(&FailureContext<'_, E>) -> ErrorClass + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            _error: PhantomData,
        }
    }
}

impl<E, F> FailureClassifier<E> for PredicateClassifier<E, F>
where
    F: Fn(&FailureContext<'_, E>) -> ErrorClass + Send + Sync,
{
    fn classify(&self, ctx: &FailureContext<'_, E>) -> ErrorClass {
        (self.predicate)(ctx)
    }
}

impl<E, F> std::fmt::Debug for PredicateClassifier<E, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

/// Ready-made error for transports without an error type of their own
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote returned status {code}: {message}")]
    Status { code: u16, message: String },
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl RemoteFailure for OperationError {
    fn status(&self) -> Option<u16> {
        match self {
            OperationError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn is_transport(&self) -> bool {
        matches!(self, OperationError::Transport(_))
    }

    fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }
}
