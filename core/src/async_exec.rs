//! Non-blocking execution on the Tokio runtime
//!
//! The same loop as [`Guard::execute_with`], driven by a spawned task: every
//! attempt is scheduled as its own unit of work, permits are awaited instead
//! of blocked on, and backoff uses the runtime timer. Cancelling the returned
//! [`CallHandle`] (or dropping it) stops the loop at the next await point, so
//! no retry is scheduled after the caller has gone away.

use crate::classifier::{FailureClassifier, StatusClassifier};
use crate::errors::ExecutionError;
use crate::guard::{Guard, GuardInner, Verdict};
use crate::retry::RetryPolicy;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pending result of an asynchronous guarded call
///
/// Resolves to the call's outcome. Dropping the handle cancels the call.
#[must_use = "dropping a CallHandle cancels the call"]
#[derive(Debug)]
pub struct CallHandle<T, E> {
    task: JoinHandle<Result<T, ExecutionError<E>>>,
    cancel: CancellationToken,
}

impl<T, E> CallHandle<T, E> {
    /// Stop the call; it resolves to [`ExecutionError::Cancelled`] unless it
    /// already finished
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T, E> Future for CallHandle<T, E> {
    type Output = Result<T, ExecutionError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(join_outcome)
    }
}

impl<T, E> Drop for CallHandle<T, E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Guard {
    /// Run an async operation under the guard's default policy
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn execute_async<T, E, F, Fut>(&self, operation: F) -> CallHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        StatusClassifier: FailureClassifier<E>,
    {
        self.execute_async_with(self.policy().clone(), operation)
    }

    /// Run an async operation under `policy`
    ///
    /// Each attempt is spawned as a separate task. A cancelled call aborts the
    /// attempt in flight.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn execute_async_with<T, E, C, F, Fut>(
        &self,
        policy: RetryPolicy<C>,
        mut operation: F,
    ) -> CallHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        C: FailureClassifier<E> + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.spawn_call(policy, move || tokio::spawn(operation()))
    }

    /// Run a blocking operation under `policy` without blocking the runtime
    ///
    /// Each attempt runs on Tokio's blocking pool. An attempt that is already
    /// running cannot be interrupted; cancellation takes effect once it
    /// returns, and no further attempt is started.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn_blocking_with<T, E, C, F>(
        &self,
        policy: RetryPolicy<C>,
        operation: F,
    ) -> CallHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        C: FailureClassifier<E> + 'static,
        F: FnMut() -> Result<T, E> + Send + 'static,
    {
        // Attempts never overlap, the mutex only hands the closure between them
        let operation = Arc::new(Mutex::new(operation));

        self.spawn_call(policy, move || {
            let operation = Arc::clone(&operation);
            tokio::task::spawn_blocking(move || {
                let mut operation = operation.lock().unwrap_or_else(PoisonError::into_inner);
                (*operation)()
            })
        })
    }

    fn spawn_call<T, E, C, S>(&self, policy: RetryPolicy<C>, schedule: S) -> CallHandle<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        C: FailureClassifier<E> + 'static,
        S: FnMut() -> JoinHandle<Result<T, E>> + Send + 'static,
    {
        let cancel = self.cancellation_token();
        let task = tokio::spawn(drive(
            Arc::clone(self.inner()),
            policy,
            cancel.clone(),
            schedule,
        ));

        CallHandle { task, cancel }
    }
}

async fn drive<T, E, C, S>(
    inner: Arc<GuardInner>,
    policy: RetryPolicy<C>,
    cancel: CancellationToken,
    mut schedule: S,
) -> Result<T, ExecutionError<E>>
where
    C: FailureClassifier<E>,
    S: FnMut() -> JoinHandle<Result<T, E>>,
{
    let attempts = policy.effective_attempts();
    let mut attempt = 1;

    loop {
        if inner.is_cancelled(&cancel) {
            return Err(ExecutionError::Cancelled);
        }
        if inner.rejects_call() {
            return Err(inner.rejection());
        }

        inner.limiter.acquire_async(&cancel).await?;

        let started = Instant::now();
        let mut task = schedule();
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                task.abort();
                debug!(circuit = %inner.name, attempt, "Attempt abandoned on cancellation");
                return Err(ExecutionError::Cancelled);
            }
            joined = &mut task => joined,
        };
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(err) => return Err(join_failure(err)),
        };

        match outcome {
            Ok(value) => {
                inner.on_success(started.elapsed());
                return Ok(value);
            }
            Err(error) => match inner.settle(&policy, attempt, attempts, error, started.elapsed()) {
                Verdict::Retry(delay) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Verdict::Fail(err) => return Err(err),
            },
        }
    }
}

fn join_outcome<T, E>(
    joined: Result<Result<T, ExecutionError<E>>, JoinError>,
) -> Result<T, ExecutionError<E>> {
    joined.unwrap_or_else(|err| Err(join_failure(err)))
}

/// Panics propagate to the awaiting caller, aborts read as cancellation
fn join_failure<E>(err: JoinError) -> ExecutionError<E> {
    match err.try_into_panic() {
        Ok(payload) => std::panic::resume_unwind(payload),
        Err(_) => ExecutionError::Cancelled,
    }
}
