//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::consumers::{HandlerError, Incoming, ProcessingOutcome};
use tokio_util::sync::CancellationToken;

/// Implementers of the `Handler` trait can be plugged into a
/// [`DeliveryConsumer`](crate::consumers::DeliveryConsumer) to process messages retrieved
/// from a queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// The consumer takes care of acking/nacking/rejecting the message with the broker according
/// to the returned [`ProcessingOutcome`] and of retrying [`HandlerError::Failed`] errors
/// that match the configured retry predicate.
/// This decouples the low-level interactions with the message broker and the retry logic from
/// the actual business logic associated with the processing of a message.
///
/// # Cancellation
///
/// `cancellation` fires when the subscriber is shutting down. Long-running handlers should
/// watch it and return [`HandlerError::Cancelled`]: the delivery is then left unsettled and
/// the broker redelivers it.
#[async_trait::async_trait]
pub trait Handler<C, E>: Send + Sync + 'static {
    async fn handle(
        &self,
        incoming: &Incoming<C>,
        cancellation: &CancellationToken,
    ) -> Result<ProcessingOutcome<E>, HandlerError<E>>;
}
