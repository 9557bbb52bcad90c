//! Facilities to publish messages to topics. Check out [`TopicPublisher`] as a starting point.
mod message;
mod publisher;

pub use message::OutgoingMessage;
pub use publisher::{PublisherError, TopicPublisher, TopicPublisherBuilder};
