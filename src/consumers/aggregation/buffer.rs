use super::{AggregationError, BatchHandler};
use crate::consumers::ProcessingOutcome;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The batch handler invocation, awaited by every member of the batch.
///
/// `None` if the batch handler panicked.
type Resolution<E> = Shared<BoxFuture<'static, Option<ProcessingOutcome<E>>>>;

/// Identifies a message while its buffer is open, so that its caller can withdraw it.
pub(super) type Slot = u64;

/// Collects the messages of one group until the group is full or its deadline expires.
///
/// Closing is a one-way transition that hands the accumulated batch to the batch handler,
/// in a task of its own: the handler runs exactly once, even if every waiter gives up.
/// Until then a caller that stops waiting takes its message back.
pub(super) struct AggregatingBuffer<K, M, E> {
    key: K,
    limit: usize,
    deadline: Instant,
    handler: Arc<dyn BatchHandler<M, E>>,
    root: CancellationToken,
    state: Mutex<State<M, E>>,
    /// Fired once the buffer leaves the `Open` status.
    closed: CancellationToken,
}

struct State<M, E> {
    accumulated: Vec<(Slot, M)>,
    next_slot: Slot,
    status: Status<E>,
}

enum Status<E> {
    Open,
    Resolving(Resolution<E>),
    Discarded,
}

/// What happened to a message handed to [`AggregatingBuffer::append`].
pub(super) enum Appended<M> {
    /// Waiting for more messages or for the deadline.
    Pending(Slot),
    /// The message filled the buffer, which is now closed.
    Filled,
    /// The buffer was already closed; the message is handed back.
    Closed(M),
}

/// Why a waiter woke up.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Wake {
    Closed,
    DeadlineReached,
}

impl<K, M, E> AggregatingBuffer<K, M, E>
where
    M: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(super) fn new(
        key: K,
        limit: usize,
        timeout: Duration,
        handler: Arc<dyn BatchHandler<M, E>>,
        root: CancellationToken,
    ) -> Self {
        Self {
            key,
            limit,
            deadline: Instant::now() + timeout,
            handler,
            root,
            state: Mutex::new(State {
                accumulated: Vec::with_capacity(limit),
                next_slot: 0,
                status: Status::Open,
            }),
            closed: CancellationToken::new(),
        }
    }

    pub(super) fn key(&self) -> &K {
        &self.key
    }

    fn lock(&self) -> MutexGuard<'_, State<M, E>> {
        // The state is consistent after every statement, a panicking holder cannot corrupt it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn append(&self, message: M) -> Appended<M> {
        let mut state = self.lock();
        if !matches!(state.status, Status::Open) {
            return Appended::Closed(message);
        }
        let slot = state.next_slot;
        state.next_slot += 1;
        state.accumulated.push((slot, message));
        if state.accumulated.len() >= self.limit {
            self.resolve(&mut state);
            Appended::Filled
        } else {
            Appended::Pending(slot)
        }
    }

    /// Take the message in `slot` out of the buffer, if the buffer is still open.
    ///
    /// Returns how many messages are left, `None` if the buffer was not open: the message
    /// is already part of a batch, or was discarded.
    pub(super) fn withdraw(&self, slot: Slot) -> Option<usize> {
        let mut state = self.lock();
        if !matches!(state.status, Status::Open) {
            return None;
        }
        state.accumulated.retain(|(s, _)| *s != slot);
        Some(state.accumulated.len())
    }

    /// Close the buffer and start the batch handler.
    ///
    /// Returns `false` if the buffer was not open.
    pub(super) fn close(&self) -> bool {
        let mut state = self.lock();
        if !matches!(state.status, Status::Open) {
            return false;
        }
        self.resolve(&mut state);
        true
    }

    /// Close the buffer dropping its messages. Waiters get [`AggregationError::Cancelled`].
    pub(super) fn discard(&self) {
        let mut state = self.lock();
        if matches!(state.status, Status::Open) {
            tracing::debug!(
                batch_size = state.accumulated.len(),
                "Discarding a partial batch"
            );
            state.accumulated.clear();
            state.status = Status::Discarded;
            self.closed.cancel();
        }
    }

    fn resolve(&self, state: &mut State<M, E>) {
        let batch: Vec<M> = std::mem::take(&mut state.accumulated)
            .into_iter()
            .map(|(_, message)| message)
            .collect();
        tracing::debug!(batch_size = batch.len(), "Aggregation buffer closed");
        let handler = Arc::clone(&self.handler);
        let cancellation = self.root.child_token();
        let task = tokio::spawn(async move { handler.handle_batch(batch, cancellation).await });
        let resolution = async move {
            match task.await {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::error!(error.message = %e, "The batch handler did not complete");
                    None
                }
            }
        }
        .boxed()
        .shared();
        state.status = Status::Resolving(resolution);
        self.closed.cancel();
    }

    /// Suspend until the buffer is closed, its deadline expires or either token is cancelled.
    pub(super) async fn wait(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<Wake, AggregationError> {
        tokio::select! {
            biased;
            _ = self.root.cancelled() => Err(AggregationError::Cancelled),
            _ = cancellation.cancelled() => Err(AggregationError::Cancelled),
            _ = self.closed.cancelled() => Ok(Wake::Closed),
            _ = tokio::time::sleep_until(self.deadline) => Ok(Wake::DeadlineReached),
        }
    }

    /// The outcome of the batch this buffer was resolved into.
    pub(super) async fn outcome(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<ProcessingOutcome<E>, AggregationError> {
        let resolution = match &self.lock().status {
            Status::Resolving(resolution) => resolution.clone(),
            Status::Discarded => return Err(AggregationError::Cancelled),
            Status::Open => {
                return Err(AggregationError::RegistryCorruption(
                    "an open aggregation buffer was asked for its outcome",
                ))
            }
        };
        tokio::select! {
            biased;
            _ = self.root.cancelled() => Err(AggregationError::Cancelled),
            _ = cancellation.cancelled() => Err(AggregationError::Cancelled),
            outcome = resolution => outcome.ok_or(AggregationError::BatchHandlerPanicked),
        }
    }
}
