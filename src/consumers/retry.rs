use crate::consumers::{Delivery, HandlerError};
use std::fmt;
use std::sync::Arc;

/// Invoked before every retry with the error that caused it.
///
/// Attempt numbers start at `1` (the first retry, i.e. the second invocation).
/// Failures are logged and otherwise ignored: an observer cannot change the outcome of
/// processing.
pub trait RetryObserver<E>: Send + Sync + 'static {
    fn on_retry(&self, delivery: &Delivery, error: &E, attempt: u32) -> Result<(), anyhow::Error>;
}

impl<E, F> RetryObserver<E> for F
where
    F: Fn(&Delivery, &E, u32) -> Result<(), anyhow::Error> + Send + Sync + 'static,
{
    fn on_retry(&self, delivery: &Delivery, error: &E, attempt: u32) -> Result<(), anyhow::Error> {
        self(delivery, error, attempt)
    }
}

/// How many times, and on which errors, a handler is invoked again before giving up.
///
/// With a `retry_count` of `R` the handler runs at most `R + 1` times, back to back.
/// Only [`HandlerError::Failed`] errors matching the predicate are retried.
pub struct RetryPolicy<E> {
    retry_count: u32,
    is_retryable: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    observer: Option<Arc<dyn RetryObserver<E>>>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            retry_count: self.retry_count,
            is_retryable: Arc::clone(&self.is_retryable),
            observer: self.observer.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_count", &self.retry_count)
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

impl<E: 'static> RetryPolicy<E> {
    /// A single invocation, no retries.
    pub fn none() -> Self {
        Self {
            retry_count: 0,
            is_retryable: Arc::new(|_: &E| false),
            observer: None,
        }
    }

    /// Retry up to `retry_count` times every error that satisfies `is_retryable`.
    pub fn new<P>(retry_count: u32, is_retryable: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            retry_count,
            is_retryable: Arc::new(is_retryable),
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: impl RetryObserver<E>) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Whether a failed attempt number `attempt` (starting at `1` for the first invocation)
    /// should be followed by another one.
    pub(crate) fn should_retry(&self, error: &HandlerError<E>, attempt: u32) -> bool {
        match error {
            HandlerError::Failed(e) => attempt <= self.retry_count && (self.is_retryable)(e),
            HandlerError::Cancelled | HandlerError::Fatal(_) => false,
        }
    }

    pub(crate) fn notify(&self, delivery: &Delivery, error: &E, attempt: u32) {
        if let Some(observer) = &self.observer {
            if let Err(e) = observer.on_retry(delivery, error, attempt) {
                tracing::error!(
                    error.message = %e,
                    error.details = ?e,
                    attempt,
                    "The retry observer failed"
                );
            }
        }
    }
}

impl<E: 'static> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self::none()
    }
}
