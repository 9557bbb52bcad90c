use crate::consumers::{
    Acknowledger, ConsumerError, Delivery, Handler, HandlerError, Incoming, ProcessingOutcome,
    RetryObserver, RetryPolicy, SubscriptionInfo,
};
use amq_protocol_types::DeliveryTag;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The action we asked the broker to take when finalising the processing of
/// the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// Positive acknowledgement - the message can be removed from the queue.
    Ack,
    /// The message was processed successfully on an auto-ack subscription:
    /// the broker already considers it settled, nothing was sent.
    AutoAck,
    /// Negative acknowledgement. The message goes back to the queue if `requeue` is set,
    /// to the dead letter exchange (if configured) otherwise.
    Nack { requeue: bool },
    /// Rejection. Same routing rules as [`BrokerAction::Nack`].
    Reject { requeue: bool },
    /// Processing was cancelled: no instruction was sent and the broker will redeliver the
    /// message once the channel is closed.
    Unsettled,
}

impl BrokerAction {
    async fn execute(
        &self,
        acknowledger: &dyn Acknowledger,
        delivery_tag: DeliveryTag,
    ) -> Result<(), anyhow::Error> {
        match *self {
            Self::Ack => acknowledger.ack(delivery_tag, false).await,
            Self::Nack { requeue } => acknowledger.nack(delivery_tag, false, requeue).await,
            Self::Reject { requeue } => acknowledger.reject(delivery_tag, requeue).await,
            Self::AutoAck | Self::Unsettled => Ok(()),
        }
    }
}

/// `should_requeue` without the logging: `false` on auto-ack subscriptions, otherwise
/// whether the message still has redeliveries left before being dead-lettered.
///
/// The budget is the dead letter topic's `max_retries`, `0` if there is none.
pub fn should_requeue(subscription: &SubscriptionInfo, redelivery_count: u64) -> bool {
    if subscription.auto_ack() {
        return false;
    }
    let max_retries = subscription
        .dead_letter_topic()
        .map(|dead_letter| u64::from(dead_letter.max_retries()))
        .unwrap_or_default();
    redelivery_count < max_retries
}

/// Turns each delivery into exactly one terminal broker call.
///
/// `DeliveryConsumer` invokes the handler under the retry policy, converts the terminal result
/// into a [`ProcessingOutcome`] and applies it to the channel:
///
/// | Result                                    | Broker call                                  |
/// |-------------------------------------------|----------------------------------------------|
/// | `Acknowledged`                            | `ack` (nothing on auto-ack subscriptions)    |
/// | `NegativelyAcknowledged`, `Failure`, `Err(Failed)` | `nack`, requeue per [`should_requeue`] |
/// | `Rejected`                                | `reject`, requeue per [`should_requeue`]     |
/// | `Err(Cancelled)`                          | none                                         |
/// | `Err(Fatal)`, application failure         | forced `reject`, error returned              |
///
/// It is cheap to clone: clones share the handler, the acknowledger and the cancellation
/// token.
pub struct DeliveryConsumer<C, E> {
    subscription: Arc<SubscriptionInfo>,
    context: Arc<C>,
    handler: Arc<dyn Handler<C, E>>,
    // One terminal call at a time per channel.
    acknowledger: Arc<Mutex<Box<dyn Acknowledger>>>,
    retry_policy: RetryPolicy<E>,
    cancellation: CancellationToken,
}

impl<C, E> Clone for DeliveryConsumer<C, E> {
    fn clone(&self) -> Self {
        Self {
            subscription: Arc::clone(&self.subscription),
            context: Arc::clone(&self.context),
            handler: Arc::clone(&self.handler),
            acknowledger: Arc::clone(&self.acknowledger),
            retry_policy: self.retry_policy.clone(),
            cancellation: self.cancellation.clone(),
        }
    }
}

impl<C, E> DeliveryConsumer<C, E>
where
    C: Send + Sync + 'static,
    E: fmt::Display + Send + Sync + 'static,
{
    /// The retry budget is taken from [`SubscriptionInfo::retry_count`].
    pub fn builder(
        subscription: impl Into<Arc<SubscriptionInfo>>,
        // If the context is already behind an Arc pointer, we won't double-wrap it.
        context: impl Into<Arc<C>>,
    ) -> DeliveryConsumerBuilder<C, E> {
        DeliveryConsumerBuilder {
            subscription: subscription.into(),
            context: context.into(),
            is_retryable: None,
            observer: None,
            cancellation: None,
        }
    }

    pub fn subscription(&self) -> &SubscriptionInfo {
        &self.subscription
    }

    /// The token observed by the handler and by the retry loop.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Process a delivery and settle it with the broker.
    ///
    /// Returns the instruction that was sent. Errors are only returned for faults the
    /// consumer could not absorb; the delivery has been rejected (best effort) in that case.
    #[tracing::instrument(
        name = "process_delivery",
        skip_all,
        fields(
            subscription = %self.subscription.subscription_name(),
            exchange = %delivery.exchange.as_str(),
            routing_key = %delivery.routing_key.as_str(),
            message_id = delivery.message_id().unwrap_or_default(),
            delivery_tag = delivery.delivery_tag,
        )
    )]
    pub async fn process(&self, delivery: Delivery) -> Result<BrokerAction, ConsumerError> {
        let incoming = Incoming {
            context: Arc::clone(&self.context),
            message: delivery,
            subscription_name: self.subscription.subscription_name().to_owned(),
        };
        let result = self.handle_with_retries(&incoming).await;
        let delivery = &incoming.message;
        match result {
            Ok(outcome) => self.apply(delivery, outcome).await,
            Err(HandlerError::Failed(e)) => {
                self.apply(delivery, ProcessingOutcome::Failure(e)).await
            }
            Err(HandlerError::Cancelled) => {
                tracing::info!("Processing was cancelled, the message is left unsettled");
                Ok(BrokerAction::Unsettled)
            }
            Err(HandlerError::Fatal(e)) => {
                tracing::error!(
                    error.message = %e,
                    error.details = ?e,
                    "The message handler hit an unrecoverable fault"
                );
                self.force_reject(delivery, &e).await;
                Err(ConsumerError::Unrecoverable(e))
            }
        }
    }

    async fn handle_with_retries(
        &self,
        incoming: &Incoming<C>,
    ) -> Result<ProcessingOutcome<E>, HandlerError<E>> {
        let mut attempt = 1;
        loop {
            // Checked before every attempt, the first one included.
            if self.cancellation.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            let error = match self.handler.handle(incoming, &self.cancellation).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };
            if !self.retry_policy.should_retry(&error, attempt) {
                return Err(error);
            }
            if let HandlerError::Failed(e) = &error {
                tracing::warn!(
                    error.message = %e,
                    attempt,
                    retry_count = self.retry_policy.retry_count(),
                    "Processing failed with a retryable error, retrying"
                );
                self.retry_policy.notify(&incoming.message, e, attempt);
            }
            attempt += 1;
        }
    }

    async fn apply(
        &self,
        delivery: &Delivery,
        outcome: ProcessingOutcome<E>,
    ) -> Result<BrokerAction, ConsumerError> {
        let action = match outcome {
            ProcessingOutcome::Acknowledged => {
                tracing::debug!("Message processed successfully");
                if self.subscription.auto_ack() {
                    BrokerAction::AutoAck
                } else {
                    BrokerAction::Ack
                }
            }
            ProcessingOutcome::NegativelyAcknowledged { reason } if reason.trim().is_empty() => {
                let source =
                    anyhow::anyhow!("Unsupported outcome: a negative acknowledgement without a reason");
                return Err(self.fail_application(delivery, source).await);
            }
            ProcessingOutcome::NegativelyAcknowledged { reason } => {
                tracing::warn!(reason = %reason, "Message negatively acknowledged");
                BrokerAction::Nack {
                    requeue: self.should_requeue(delivery),
                }
            }
            ProcessingOutcome::Failure(e) => {
                tracing::error!(error.message = %e, "Message processing failed");
                BrokerAction::Nack {
                    requeue: self.should_requeue(delivery),
                }
            }
            ProcessingOutcome::Rejected { reason } => {
                tracing::warn!(reason = %reason, "Message rejected");
                BrokerAction::Reject {
                    requeue: self.should_requeue(delivery),
                }
            }
        };

        let result = {
            let acknowledger = self.acknowledger.lock().await;
            action
                .execute(&**acknowledger, delivery.delivery_tag)
                .await
        };
        match result {
            Ok(()) => {
                tracing::debug!(broker_action = ?action, "Delivery settled");
                Ok(action)
            }
            Err(e) => Err(self.fail_application(delivery, e).await),
        }
    }

    /// Whether a message that was not processed successfully should go back to the queue.
    ///
    /// See [`should_requeue`].
    pub fn should_requeue(&self, delivery: &Delivery) -> bool {
        let redelivery_count = delivery.redelivery_count();
        let requeue = should_requeue(&self.subscription, redelivery_count);
        if !requeue && !self.subscription.auto_ack() {
            if let Some(dead_letter) = self.subscription.dead_letter_topic() {
                tracing::warn!(
                    redelivery_count,
                    max_retries = dead_letter.max_retries(),
                    dead_letter_exchange = %dead_letter.name(),
                    "Redelivery budget exhausted, the message is routed to the dead letter exchange"
                );
            }
        }
        requeue
    }

    async fn fail_application(&self, delivery: &Delivery, source: anyhow::Error) -> ConsumerError {
        tracing::error!(
            error.message = %source,
            error.details = ?source,
            "Failed to apply the processing outcome"
        );
        self.force_reject(delivery, &source).await;
        ConsumerError::OutcomeApplication {
            delivery_tag: delivery.delivery_tag,
            source,
        }
    }

    async fn force_reject(&self, delivery: &Delivery, cause: &anyhow::Error) {
        let requeue = self.should_requeue(delivery);
        let outcome = ProcessingOutcome::<E>::reject(format!("Internal fault: {cause}"));
        tracing::warn!(outcome = %outcome, requeue, "Rejecting the message");
        let acknowledger = self.acknowledger.lock().await;
        if let Err(e) = acknowledger.reject(delivery.delivery_tag, requeue).await {
            tracing::error!(
                error.message = %e,
                error.details = ?e,
                "Failed to reject the message"
            );
        }
    }
}

/// Builds a [`DeliveryConsumer`].
///
/// Use [`DeliveryConsumer::builder`] to create one.
pub struct DeliveryConsumerBuilder<C, E> {
    subscription: Arc<SubscriptionInfo>,
    context: Arc<C>,
    is_retryable: Option<Arc<dyn Fn(&E) -> bool + Send + Sync>>,
    observer: Option<Box<dyn RetryObserver<E>>>,
    cancellation: Option<CancellationToken>,
}

impl<C, E> DeliveryConsumerBuilder<C, E>
where
    C: Send + Sync + 'static,
    E: fmt::Display + Send + Sync + 'static,
{
    /// Only retry errors that satisfy `is_retryable`.
    ///
    /// Every [`HandlerError::Failed`] error is retried when no predicate is set.
    pub fn retry_on<P>(mut self, is_retryable: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_retryable = Some(Arc::new(is_retryable));
        self
    }

    /// Invoked before every retry.
    pub fn with_retry_observer(mut self, observer: impl RetryObserver<E>) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Share a cancellation token with the consumer (e.g. a child of the application
    /// shutdown token). A fresh token is used otherwise.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn build<A, H>(self, acknowledger: A, handler: H) -> DeliveryConsumer<C, E>
    where
        A: Acknowledger,
        H: Handler<C, E>,
    {
        let retry_count = self.subscription.retry_count();
        let mut retry_policy = match self.is_retryable {
            Some(is_retryable) => RetryPolicy::new(retry_count, move |e: &E| is_retryable(e)),
            None => RetryPolicy::new(retry_count, |_: &E| true),
        };
        if let Some(observer) = self.observer {
            retry_policy = retry_policy.with_observer(
                move |delivery: &Delivery, error: &E, attempt: u32| {
                    observer.on_retry(delivery, error, attempt)
                },
            );
        }
        DeliveryConsumer {
            subscription: self.subscription,
            context: self.context,
            handler: Arc::new(handler),
            acknowledger: Arc::new(Mutex::new(Box::new(acknowledger))),
            retry_policy,
            cancellation: self.cancellation.unwrap_or_default(),
        }
    }
}
