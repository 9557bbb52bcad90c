use crate::amqp::topology::GENERAL_ROUTING_KEY;
use crate::consumers::TopicInfo;
use crate::pool::ChannelPool;
use crate::publishers::OutgoingMessage;
use anyhow::Context;
use lapin::message::BasicReturnMessage;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// AMQP reply code for a message that could not be routed to any queue.
const NO_ROUTE: u16 = 312;

/// Publishes messages to topics.
///
/// A topic exchange is declared the first time a message is published to it through the
/// channel pool; subsequent publications reuse the declaration. Messages are routed with the `general` routing key,
/// which every subscription of the topic is bound with, or to one subscription only with
/// [`TopicPublisher::publish_to_subscription`].
///
/// # Fault tolerance
///
/// Channels come from a [`ChannelPool`]: broken channels and connections are recycled and
/// re-created on demand.
///
/// # How do I build a `TopicPublisher`?
///
/// ```rust
/// use carrot_relay::amqp::configuration::RabbitMqSettings;
/// use carrot_relay::amqp::ConnectionFactory;
/// use carrot_relay::pool::{publishing_pool, PoolSizes};
/// use carrot_relay::publishers::TopicPublisher;
///
/// pub fn get_publisher() -> Result<TopicPublisher, anyhow::Error> {
///     let settings = RabbitMqSettings::default();
///     let connection_factory = ConnectionFactory::new_from_config(&settings)?;
///     let channel_pool = publishing_pool(connection_factory, PoolSizes::default())?;
///
///     Ok(TopicPublisher::builder(channel_pool)
///         .publish_timeout(std::time::Duration::from_secs(3))
///         .build())
/// }
/// ```
pub struct TopicPublisher {
    /// Its [`ConfirmMode`](crate::pool::ConfirmMode) determines if `TopicPublisher` waits for
    /// AMQP publisher confirms or not.
    channel_pool: ChannelPool,
    /// Applied to each publication, including the acquisition of a channel.
    timeout: Duration,
}

/// Error returned when trying to publish a message using [`TopicPublisher`].
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    GenericError(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while trying to publish the message")]
    TimeoutError,
    #[error("The message could not be routed: {0:?}")]
    UnroutableMessage(Box<BasicReturnMessage>),
    #[error("The RabbitMq broker nacked the publishing of the message: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
    #[error("Publishing stopped after {published} messages")]
    Interrupted {
        published: usize,
        #[source]
        source: Box<PublisherError>,
    },
}

impl TopicPublisher {
    /// Start building a [`TopicPublisher`].
    pub fn builder(channel_pool: ChannelPool) -> TopicPublisherBuilder {
        TopicPublisherBuilder {
            channel_pool,
            timeout: Duration::from_secs(3),
        }
    }

    /// Publish a message to every subscription of `topic`.
    #[tracing::instrument(skip_all, fields(exchange = %topic.name()))]
    pub async fn publish(
        &self,
        topic: &TopicInfo,
        message: impl Into<OutgoingMessage>,
    ) -> Result<(), PublisherError> {
        self.publish_with_routing_key(topic, GENERAL_ROUTING_KEY, message.into())
            .await?;
        tracing::info!("Message published");
        Ok(())
    }

    /// Publish messages to `topic` in order, stopping at the first failure.
    ///
    /// Returns how many messages were published.
    #[tracing::instrument(skip_all, fields(exchange = %topic.name()))]
    pub async fn publish_all<I>(&self, topic: &TopicInfo, messages: I) -> Result<usize, PublisherError>
    where
        I: IntoIterator,
        I::Item: Into<OutgoingMessage>,
    {
        let mut published = 0;
        for message in messages {
            if let Err(e) = self
                .publish_with_routing_key(topic, GENERAL_ROUTING_KEY, message.into())
                .await
            {
                tracing::error!(error.message = %e, published, "Failed to publish messages");
                return Err(PublisherError::Interrupted {
                    published,
                    source: Box::new(e),
                });
            }
            published += 1;
        }
        tracing::info!(published, "Messages published");
        Ok(published)
    }

    /// Publish a message to a single subscription of `topic`, e.g. to replay a message that
    /// was dead-lettered.
    #[tracing::instrument(skip_all, fields(exchange = %topic.name(), subscription = subscription_name))]
    pub async fn publish_to_subscription(
        &self,
        topic: &TopicInfo,
        subscription_name: &str,
        message: impl Into<OutgoingMessage>,
    ) -> Result<(), PublisherError> {
        self.publish_with_routing_key(topic, subscription_name, message.into())
            .await
    }

    async fn publish_with_routing_key(
        &self,
        topic: &TopicInfo,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), PublisherError> {
        let manager = self.channel_pool.manager();
        let options = BasicPublishOptions {
            mandatory: manager.confirm_mode().mandatory(),
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        let properties = inject_amqp_properties(message.properties);

        // Acquiring the channel, declaring the topic and publishing share the same timeout.
        let publish_future = async {
            let channel = self
                .channel_pool
                .get()
                .await
                .map_err(anyhow::Error::msg)
                .context("Failed to acquire a healthy channel from the pool when trying to publish to RabbitMq")
                .map_err(PublisherError::GenericError)?;

            manager
                .ensure_topic(&channel, topic)
                .await
                .map_err(PublisherError::GenericError)?;

            let result = publish(
                &channel,
                &message.payload,
                options,
                topic.name(),
                routing_key,
                properties,
            )
            .await;
            if let Err(PublisherError::GenericError(_)) = &result {
                // The exchange may be gone (e.g. an auto-delete topic): declare it again next time.
                manager.forget_topic(topic);
            }
            result
        };

        match tokio::time::timeout(self.timeout, publish_future).await {
            Ok(result) => result,
            Err(_) => Err(PublisherError::TimeoutError),
        }
    }
}

/// A builder for [`TopicPublisher`].
///
/// Use [`TopicPublisher::builder`] as entrypoint.
pub struct TopicPublisherBuilder {
    channel_pool: ChannelPool,
    timeout: Duration,
}

impl TopicPublisherBuilder {
    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> TopicPublisher {
        TopicPublisher {
            channel_pool: self.channel_pool,
            timeout: self.timeout,
        }
    }
}

/// Publish a payload on a RabbitMq exchange, waiting for publisher confirmation from the
/// RabbitMq broker.
///
/// The mandatory flag tells the broker how to react if the message cannot be routed to a queue.
/// If this flag is `true`, the broker will return an unroutable message with a Return method.
/// If this flag is `false`, the broker silently drops the message.
#[tracing::instrument(level = "debug", skip(channel, payload, properties))]
async fn publish(
    channel: &Channel,
    payload: &[u8],
    options: BasicPublishOptions,
    exchange: &str,
    routing_key: &str,
    properties: BasicProperties,
) -> Result<(), PublisherError> {
    // Delivery mode: Non-persistent (1) or persistent (2).
    let properties = properties.with_delivery_mode(2);

    let confirm = channel
        .basic_publish(exchange, routing_key, options, payload, properties)
        .await
        .map_err(|e| PublisherError::GenericError(e.into()))?
        .await
        .map_err(|e| PublisherError::GenericError(e.into()))?;

    match confirm {
        Confirmation::Ack(Some(return_message)) if return_message.reply_code == NO_ROUTE => {
            Err(PublisherError::UnroutableMessage(return_message))
        }
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        Confirmation::Nack(nack) => Err(PublisherError::NegativeAck(nack)),
    }
}

/// Set a `timestamp` (seconds since the Unix epoch) and a random `message_id` unless the
/// caller already did.
fn inject_amqp_properties(properties: BasicProperties) -> BasicProperties {
    let properties = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(now) => {
            let timestamp = properties.timestamp().unwrap_or(now.as_secs());
            properties.with_timestamp(timestamp)
        }
        Err(_) => {
            warn!("System time is before 1970");
            properties
        }
    };

    let message_id = properties
        .message_id()
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string().into());
    properties.with_message_id(message_id)
}
