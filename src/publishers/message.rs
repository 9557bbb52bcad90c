use amq_protocol_types::{FieldTable, ShortString, Timestamp};
use lapin::BasicProperties;

/// A message to be published via [`TopicPublisher`](super::TopicPublisher).
///
/// The exchange and the routing key are chosen by the publisher.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutgoingMessage {
    /// The body of the message - as a sequence of bytes.
    pub payload: Vec<u8>,
    /// AMQP properties attached to the message.
    pub properties: BasicProperties,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            properties: BasicProperties::default(),
        }
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    pub fn with_content_type(self, value: ShortString) -> Self {
        self.props(|p| p.with_content_type(value))
    }

    pub fn with_headers(self, value: FieldTable) -> Self {
        self.props(|p| p.with_headers(value))
    }

    pub fn with_correlation_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_correlation_id(value))
    }

    pub fn with_message_id(self, value: ShortString) -> Self {
        self.props(|p| p.with_message_id(value))
    }

    pub fn with_timestamp(self, value: Timestamp) -> Self {
        self.props(|p| p.with_timestamp(value))
    }
}

impl From<Vec<u8>> for OutgoingMessage {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<&[u8]> for OutgoingMessage {
    fn from(payload: &[u8]) -> Self {
        Self::new(payload)
    }
}
