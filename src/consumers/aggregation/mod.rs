//! Group related messages and process each group with a single batch handler call.
//!
//! Messages are grouped by a caller-defined key. A group closes when it reaches `limit`
//! messages or when `timeout` has elapsed since its first message, whichever comes first.
//! The batch handler is then invoked exactly once with every message of the group, and its
//! [`ProcessingOutcome`] is returned to each of the callers that contributed a message -
//! each of them settles its own delivery accordingly.
//!
//! [`AggregatingHandler`] plugs an [`Aggregator`] into a
//! [`DeliveryConsumer`](crate::consumers::DeliveryConsumer).
mod buffer;
mod registry;

use crate::consumers::{Delivery, Handler, HandlerError, Incoming, ProcessingOutcome};
use buffer::{AggregatingBuffer, Wake};
use registry::{PendingMessage, Registry};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug)]
pub enum AggregationError {
    #[error("The aggregation limit must be at least 1.")]
    InvalidLimit,
    /// The caller or the aggregator was cancelled before the batch outcome was available.
    #[error("Aggregation was cancelled.")]
    Cancelled,
    #[error("The aggregation registry is corrupted: {0}.")]
    RegistryCorruption(&'static str),
    #[error("The batch handler panicked.")]
    BatchHandlerPanicked,
}

/// Processes a closed group of messages.
///
/// It is implemented for async functions with a matching signature -
/// `Fn(Vec<M>, CancellationToken) -> Fut`.
#[async_trait::async_trait]
pub trait BatchHandler<M, E>: Send + Sync + 'static {
    /// `batch` holds the messages in arrival order.
    /// `cancellation` fires when the aggregator is shut down.
    async fn handle_batch(
        &self,
        batch: Vec<M>,
        cancellation: CancellationToken,
    ) -> ProcessingOutcome<E>;
}

#[async_trait::async_trait]
impl<M, E, F, Fut> BatchHandler<M, E> for F
where
    F: Fn(Vec<M>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProcessingOutcome<E>> + Send + 'static,
    M: Send + 'static,
    E: Send + 'static,
{
    async fn handle_batch(
        &self,
        batch: Vec<M>,
        cancellation: CancellationToken,
    ) -> ProcessingOutcome<E> {
        self(batch, cancellation).await
    }
}

/// Groups messages by key and resolves each group with one [`BatchHandler`] call.
///
/// Each `Aggregator` owns its registry of open groups: two aggregators never share a group.
pub struct Aggregator<K, M, E> {
    registry: Registry<K, M, E>,
    handler: Arc<dyn BatchHandler<M, E>>,
    limit: usize,
    timeout: Duration,
    root: CancellationToken,
}

impl<K, M, E> Aggregator<K, M, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    M: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// `limit` must be at least 1. A limit of 1 resolves each message on its own.
    pub fn new(
        limit: usize,
        timeout: Duration,
        handler: impl BatchHandler<M, E>,
    ) -> Result<Self, AggregationError> {
        if limit == 0 {
            return Err(AggregationError::InvalidLimit);
        }
        Ok(Self {
            registry: Registry::new(),
            handler: Arc::new(handler),
            limit,
            timeout,
            root: CancellationToken::new(),
        })
    }

    /// Tie the aggregator to an outer cancellation token (e.g. the subscriber shutdown
    /// token): cancelling it releases every waiting caller.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.root = parent.child_token();
        self
    }

    /// Add `message` to the group identified by `key` and wait for the outcome of the batch
    /// it ends up in.
    ///
    /// Returns [`AggregationError::Cancelled`] if `cancellation` (or the aggregator) is
    /// cancelled first. A message whose caller stops waiting before its group closes is
    /// taken out of the group: the batch handler never sees it.
    #[tracing::instrument(name = "aggregate", skip_all)]
    pub async fn aggregate(
        &self,
        key: K,
        message: M,
        cancellation: &CancellationToken,
    ) -> Result<ProcessingOutcome<E>, AggregationError> {
        let (buffer, slot) = self.registry.enqueue(key, message, |key| {
            AggregatingBuffer::new(
                key,
                self.limit,
                self.timeout,
                Arc::clone(&self.handler),
                self.root.clone(),
            )
        })?;
        // Withdraws the message if we stop waiting before the buffer closes.
        let pending = PendingMessage::new(&self.registry, &buffer, slot);
        let wake = buffer.wait(cancellation).await?;
        if wake == Wake::DeadlineReached {
            self.registry.seal(&buffer)?;
        }
        pending.settle();
        buffer.outcome(cancellation).await
    }

    /// The number of groups still collecting messages.
    pub fn pending_groups(&self) -> usize {
        self.registry.len()
    }

    /// Drop every partial group. Their callers get [`AggregationError::Cancelled`] and the
    /// batch handler is not invoked for them.
    pub fn clear(&self) {
        self.registry.clear();
    }

    /// Release every waiting caller and cancel running batch handlers.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.clear();
    }
}

impl<K, M, E> Drop for Aggregator<K, M, E> {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

type Decoder<M, E> = dyn Fn(&Delivery) -> Result<M, E> + Send + Sync;
type KeySelector<K, M> = dyn Fn(&M) -> K + Send + Sync;

/// A [`Handler`] that decodes each delivery, routes it through an [`Aggregator`] and
/// settles it with the outcome of its batch.
///
/// Decoding failures are returned as [`HandlerError::Failed`], hence subject to the retry
/// policy. Cancellation maps to [`HandlerError::Cancelled`]; every other aggregation error
/// is unrecoverable.
pub struct AggregatingHandler<K, M, E> {
    aggregator: Arc<Aggregator<K, M, E>>,
    decode: Box<Decoder<M, E>>,
    key: Box<KeySelector<K, M>>,
}

impl<K, M, E> AggregatingHandler<K, M, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    M: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// `key` must be a pure function of the message.
    pub fn new<D, G>(aggregator: impl Into<Arc<Aggregator<K, M, E>>>, decode: D, key: G) -> Self
    where
        D: Fn(&Delivery) -> Result<M, E> + Send + Sync + 'static,
        G: Fn(&M) -> K + Send + Sync + 'static,
    {
        Self {
            aggregator: aggregator.into(),
            decode: Box::new(decode),
            key: Box::new(key),
        }
    }

    pub fn aggregator(&self) -> &Aggregator<K, M, E> {
        &self.aggregator
    }
}

#[async_trait::async_trait]
impl<C, K, M, E> Handler<C, E> for AggregatingHandler<K, M, E>
where
    C: Send + Sync + 'static,
    K: Eq + Hash + Clone + Send + Sync + 'static,
    M: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    async fn handle(
        &self,
        incoming: &Incoming<C>,
        cancellation: &CancellationToken,
    ) -> Result<ProcessingOutcome<E>, HandlerError<E>> {
        let message = (self.decode)(&incoming.message)?;
        let key = (self.key)(&message);
        match self.aggregator.aggregate(key, message, cancellation).await {
            Ok(outcome) => Ok(outcome),
            Err(AggregationError::Cancelled) => Err(HandlerError::Cancelled),
            Err(e) => Err(HandlerError::Fatal(e.into())),
        }
    }
}
