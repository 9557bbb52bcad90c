use super::buffer::{AggregatingBuffer, Appended, Slot};
use super::AggregationError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;

/// The open buffers, by grouping key.
///
/// Every transition that removes a buffer from the map (filling it, sealing it at the
/// deadline, emptying it, discarding it) happens while holding the entry lock for its key,
/// so a registered buffer is always open.
pub(super) struct Registry<K, M, E> {
    buffers: DashMap<K, Arc<AggregatingBuffer<K, M, E>>>,
}

impl<K, M, E> Registry<K, M, E>
where
    K: Eq + Hash + Clone,
    M: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(super) fn new() -> Self {
        Self {
            buffers: DashMap::new(),
        }
    }

    /// Append `message` to the open buffer for `key`, creating one with `new_buffer` if
    /// there is none.
    ///
    /// A buffer filled by `message` is unregistered before returning: later messages for
    /// the same key start a new buffer. The slot of `message` is returned while its buffer
    /// is still open.
    pub(super) fn enqueue<F>(
        &self,
        key: K,
        message: M,
        new_buffer: F,
    ) -> Result<(Arc<AggregatingBuffer<K, M, E>>, Option<Slot>), AggregationError>
    where
        F: FnOnce(K) -> AggregatingBuffer<K, M, E>,
    {
        match self.buffers.entry(key) {
            Entry::Occupied(entry) => {
                let buffer = Arc::clone(entry.get());
                let slot = match buffer.append(message) {
                    Appended::Pending(slot) => Some(slot),
                    Appended::Filled => {
                        entry.remove();
                        None
                    }
                    Appended::Closed(_) => {
                        return Err(AggregationError::RegistryCorruption(
                            "a closed aggregation buffer was still registered",
                        ))
                    }
                };
                Ok((buffer, slot))
            }
            Entry::Vacant(entry) => {
                let buffer = Arc::new(new_buffer(entry.key().clone()));
                let slot = match buffer.append(message) {
                    Appended::Pending(slot) => {
                        entry.insert(Arc::clone(&buffer));
                        Some(slot)
                    }
                    // A limit of one: the buffer never needs to be registered.
                    Appended::Filled => None,
                    Appended::Closed(_) => {
                        return Err(AggregationError::RegistryCorruption(
                            "a new aggregation buffer was created closed",
                        ))
                    }
                };
                Ok((buffer, slot))
            }
        }
    }

    /// Close `buffer` after its deadline expired and unregister it.
    ///
    /// Several waiters of the same buffer race to seal it: the first one wins, the others
    /// find it closed. An open buffer that is no longer registered means the map was
    /// corrupted.
    pub(super) fn seal(&self, buffer: &Arc<AggregatingBuffer<K, M, E>>) -> Result<(), AggregationError> {
        match self.buffers.entry(buffer.key().clone()) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), buffer) => {
                buffer.close();
                entry.remove();
                Ok(())
            }
            _ => {
                if buffer.close() {
                    tracing::error!("An open aggregation buffer was missing from the registry");
                    Err(AggregationError::RegistryCorruption(
                        "an open aggregation buffer was missing from the registry",
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Take the message in `slot` back out of `buffer`.
    ///
    /// A buffer left empty is unregistered and discarded: nobody is waiting for its deadline
    /// any more, and the next message for its key starts a fresh group.
    pub(super) fn withdraw(&self, buffer: &Arc<AggregatingBuffer<K, M, E>>, slot: Slot) {
        match self.buffers.entry(buffer.key().clone()) {
            Entry::Occupied(entry) if Arc::ptr_eq(entry.get(), buffer) => {
                if buffer.withdraw(slot) == Some(0) {
                    buffer.discard();
                    entry.remove();
                }
            }
            // Unregistered buffers are closed, there is nothing to take back.
            _ => {
                buffer.withdraw(slot);
            }
        }
    }

    /// Discard every open buffer, dropping their messages.
    pub(super) fn clear(&self) {
        self.buffers.retain(|_, buffer| {
            buffer.discard();
            false
        });
    }

    pub(super) fn len(&self) -> usize {
        self.buffers.len()
    }
}

/// A message waiting in an open buffer.
///
/// Dropping it before [`PendingMessage::settle`] withdraws the message: a caller that gives
/// up, or whose future is dropped, never contributes to a batch.
pub(super) struct PendingMessage<'a, K, M, E>
where
    K: Eq + Hash + Clone,
    M: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    registry: &'a Registry<K, M, E>,
    buffer: &'a Arc<AggregatingBuffer<K, M, E>>,
    slot: Option<Slot>,
}

impl<'a, K, M, E> PendingMessage<'a, K, M, E>
where
    K: Eq + Hash + Clone,
    M: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(super) fn new(
        registry: &'a Registry<K, M, E>,
        buffer: &'a Arc<AggregatingBuffer<K, M, E>>,
        slot: Option<Slot>,
    ) -> Self {
        Self {
            registry,
            buffer,
            slot,
        }
    }

    /// The buffer closed: the message belongs to its batch from now on.
    pub(super) fn settle(mut self) {
        self.slot = None;
    }
}

impl<K, M, E> Drop for PendingMessage<'_, K, M, E>
where
    K: Eq + Hash + Clone,
    M: Send + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.registry.withdraw(self.buffer, slot);
        }
    }
}
