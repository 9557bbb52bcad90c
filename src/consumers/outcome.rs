use std::fmt;

/// The result of processing a single delivery (or a batch of deliveries).
///
/// `ProcessingOutcome` is what message handlers return on the way out: the
/// [`DeliveryConsumer`] translates it into the matching ack/nack/reject instruction
/// for the broker.
///
/// | Outcome                  | Broker instruction                               |
/// |--------------------------|--------------------------------------------------|
/// | `Acknowledged`           | `basic.ack` (nothing if the subscription auto-acks) |
/// | `NegativelyAcknowledged` | `basic.nack`, requeue within the dead-letter budget |
/// | `Rejected`               | `basic.reject`, requeue within the dead-letter budget |
/// | `Failure`                | `basic.nack`, requeue within the dead-letter budget |
///
/// [`DeliveryConsumer`]: crate::consumers::DeliveryConsumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome<E> {
    /// The message was processed successfully and can be removed from the queue.
    Acknowledged,
    /// The message was not processed; `reason` must not be blank.
    ///
    /// Prefer [`ProcessingOutcome::nack`] to build this variant: an outcome with a blank
    /// reason cannot be applied and is handled as an internal fault.
    NegativelyAcknowledged { reason: String },
    /// The message was refused.
    Rejected { reason: String },
    /// Processing failed with an error, either a non-retryable one or the last one
    /// after the retry budget was spent.
    Failure(E),
}

/// Returned by [`ProcessingOutcome::nack`] when the reason is blank.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("A negative acknowledgement requires a non-blank reason.")]
pub struct BlankReason;

impl<E> ProcessingOutcome<E> {
    /// Build a `NegativelyAcknowledged` outcome, refusing blank reasons.
    pub fn nack(reason: impl Into<String>) -> Result<Self, BlankReason> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(BlankReason);
        }
        Ok(Self::NegativelyAcknowledged { reason })
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    /// A short, stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Acknowledged => "acknowledged",
            Self::NegativelyAcknowledged { .. } => "negatively_acknowledged",
            Self::Rejected { .. } => "rejected",
            Self::Failure(_) => "failure",
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged)
    }
}

impl<E: fmt::Display> fmt::Display for ProcessingOutcome<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::NegativelyAcknowledged { reason } => {
                write!(f, "negatively acknowledged: {reason}")
            }
            Self::Rejected { reason } => write!(f, "rejected: {reason}"),
            Self::Failure(e) => write!(f, "failure: {e}"),
        }
    }
}
