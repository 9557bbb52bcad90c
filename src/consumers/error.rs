use amq_protocol_types::DeliveryTag;
use std::fmt;

/// The error type returned by message handlers.
///
/// It tells the [`DeliveryConsumer`](crate::consumers::DeliveryConsumer) how a failed
/// invocation must be treated:
/// - `Failed` errors go through the retry policy and end up as a
///   [`ProcessingOutcome::Failure`](crate::consumers::ProcessingOutcome::Failure);
/// - `Cancelled` stops processing without settling the delivery: the broker redelivers it
///   once the channel is closed;
/// - `Fatal` errors skip the retry policy, the delivery is rejected and the fault is
///   returned to the caller.
#[derive(Debug)]
pub enum HandlerError<E> {
    /// The application failed to process the message.
    Failed(E),
    /// Processing was interrupted by a cancellation request.
    Cancelled,
    /// An internal invariant was broken; retrying cannot help.
    Fatal(anyhow::Error),
}

impl<E> From<E> for HandlerError<E> {
    fn from(e: E) -> Self {
        Self::Failed(e)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for HandlerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed(e) => Some(e),
            Self::Cancelled => None,
            Self::Fatal(e) => Some(&**e),
        }
    }
}

impl<E: fmt::Display> fmt::Display for HandlerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "Handling of a message failed.\n{e}"),
            Self::Cancelled => write!(f, "Handling of a message was cancelled."),
            Self::Fatal(e) => write!(f, "Handling of a message hit an unrecoverable fault.\n{e}"),
        }
    }
}

/// The faults a [`DeliveryConsumer`](crate::consumers::DeliveryConsumer) cannot absorb.
///
/// In both cases the delivery has already been rejected (best effort) when the error is
/// returned.
#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to apply the processing outcome to delivery {delivery_tag}.")]
    OutcomeApplication {
        delivery_tag: DeliveryTag,
        #[source]
        source: anyhow::Error,
    },
    #[error("The message handler hit an unrecoverable fault.")]
    Unrecoverable(#[source] anyhow::Error),
}
