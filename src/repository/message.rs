use crate::amqp::convenience::redelivery_count;
use amq_protocol_types::{AMQPValue, DeliveryTag};
use lapin::message::BasicGetMessage;
use std::collections::BTreeMap;

/// A message read from a queue by [`MessageQueueRepository`](super::MessageQueueRepository).
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub delivery_tag: DeliveryTag,
    /// The topic the message was published to.
    pub exchange: String,
    pub routing_key: String,
    /// The payload, decoded as UTF-8 (invalid sequences are replaced).
    pub body: String,
    /// String-like values (short strings, long strings, byte arrays) are decoded as UTF-8.
    pub headers: BTreeMap<String, AMQPValue>,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
    /// The `type` AMQP property.
    pub kind: Option<String>,
    pub expiration: Option<String>,
    /// How many times the broker delivered the message before this read.
    pub redelivery_count: u64,
}

impl QueuedMessage {
    /// A header value, if it is string-like.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        match self.headers.get(name)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes()).ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl From<BasicGetMessage> for QueuedMessage {
    fn from(message: BasicGetMessage) -> Self {
        let delivery = message.delivery;
        let properties = &delivery.properties;
        let to_owned = |value: &Option<lapin::types::ShortString>| {
            value.as_ref().map(|value| value.as_str().to_owned())
        };
        let headers = properties
            .headers()
            .as_ref()
            .map(|headers| {
                headers
                    .inner()
                    .iter()
                    .map(|(name, value)| (name.as_str().to_owned(), decode_header(value)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            body: String::from_utf8_lossy(&delivery.data).into_owned(),
            headers,
            app_id: to_owned(properties.app_id()),
            message_id: to_owned(properties.message_id()),
            content_encoding: to_owned(properties.content_encoding()),
            content_type: to_owned(properties.content_type()),
            kind: to_owned(properties.kind()),
            expiration: to_owned(properties.expiration()),
            redelivery_count: redelivery_count(properties),
        }
    }
}

// Publishers often send text headers as raw bytes.
fn decode_header(value: &AMQPValue) -> AMQPValue {
    match value {
        AMQPValue::ByteArray(bytes) => match std::str::from_utf8(bytes.as_slice()) {
            Ok(text) => AMQPValue::LongString(text.into()),
            Err(_) => value.clone(),
        },
        value => value.clone(),
    }
}
