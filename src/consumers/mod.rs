//! Consume messages from RabbitMq reliably.
//!
//! # Building blocks
//!
//! - [`ProcessingOutcome`], what message handlers return;
//! - [`Handler`], the processing logic for a single delivery;
//! - [`DeliveryConsumer`], which retries the handler according to a [`RetryPolicy`] and turns its
//!   outcome into exactly one ack/nack/reject, requeuing until the dead-letter budget of the
//!   subscription is spent;
//! - [`Aggregator`] and [`AggregatingHandler`], to process related messages as one batch;
//! - [`Subscriber`], which runs a [`DeliveryConsumer`] against a live subscription queue.
//!
//! # Example
//!
//! ```rust,no_run
//! use carrot_relay::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
//! use carrot_relay::consumers::{
//!     Handler, HandlerError, Incoming, ProcessingOutcome, Subscriber, SubscriptionInfo, TopicInfo,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct Settle;
//!
//! #[async_trait::async_trait]
//! impl Handler<(), String> for Settle {
//!     async fn handle(
//!         &self,
//!         incoming: &Incoming<()>,
//!         _cancellation: &CancellationToken,
//!     ) -> Result<ProcessingOutcome<String>, HandlerError<String>> {
//!         if incoming.message.data.is_empty() {
//!             return Ok(ProcessingOutcome::reject("empty payload"));
//!         }
//!         Ok(ProcessingOutcome::Acknowledged)
//!     }
//! }
//!
//! # async fn run() -> Result<(), anyhow::Error> {
//! let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
//! let subscription = SubscriptionInfo::new(TopicInfo::new("payments")?, "settlement")?;
//! Subscriber::builder(factory, subscription, ())
//!     .build(Settle)
//!     .await?
//!     .run_until_sigterm()
//!     .await
//! # }
//! ```
mod acknowledger;
mod aggregation;
mod consumer;
mod error;
mod handler;
mod incoming_message;
mod outcome;
mod retry;
mod subscriber;
mod subscription;

pub use acknowledger::Acknowledger;
pub use aggregation::{AggregatingHandler, AggregationError, Aggregator, BatchHandler};
pub use consumer::{should_requeue, BrokerAction, DeliveryConsumer, DeliveryConsumerBuilder};
pub use error::{ConsumerError, HandlerError};
pub use handler::Handler;
pub use incoming_message::{Delivery, Incoming};
pub use outcome::{BlankReason, ProcessingOutcome};
pub use retry::{RetryObserver, RetryPolicy};
pub use subscriber::{Subscriber, SubscriberBuilder};
pub use subscription::{
    DeadLetterTopicInfo, InvalidSubscription, SubscriptionInfo, SubscriptionInfoBuilder,
    TopicInfo, DEFAULT_MAX_MESSAGES_IN_PARALLEL,
};
