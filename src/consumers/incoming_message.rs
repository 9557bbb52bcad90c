use crate::amqp::convenience::redelivery_count;
use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::BasicProperties;
use std::sync::Arc;

/// A dequeued message enriched with some auxiliary data, ready for processing.
///
/// `Incoming` is the input type of message handlers (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
pub struct Incoming<C> {
    /// `context` is a set of resources that are required to process the message and are outside
    /// the lifecycle of the message itself - e.g. an HTTP client for a third-party API, a db connection
    /// pool, etc.
    ///
    /// # Ownership
    ///
    /// The context is behind an `Arc` pointer: this allows multiple messages to access the same
    /// context concurrently without having to create an ad-hoc instance of `context` for each
    /// message - it might be expensive!
    pub context: Arc<C>,
    /// `message` is what we received from RabbitMq: it includes headers, payload, delivery tag, etc.
    pub message: Delivery,
    /// The name of the subscription (i.e. the queue) the message was consumed from.
    pub subscription_name: String,
}

/// A received AMQP message.
///
/// It does not carry an acker: only the
/// [`DeliveryConsumer`](crate::consumers::DeliveryConsumer) settles deliveries.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// The delivery tag of the message.
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    /// Whether this message was redelivered
    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

impl Delivery {
    /// The `message_id` AMQP property, if set.
    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    /// How many times the broker already delivered this message.
    ///
    /// Read from the `x-delivery-count` header maintained by quorum queues; `0` when absent.
    pub fn redelivery_count(&self) -> u64 {
        redelivery_count(&self.properties)
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}
