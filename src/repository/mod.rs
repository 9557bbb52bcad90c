//! Read what is waiting in a queue without consuming it, e.g. to inspect the messages
//! routed to a dead-letter topic before replaying them with
//! [`TopicPublisher::publish_to_subscription`](crate::publishers::TopicPublisher::publish_to_subscription).
mod message;
mod reader;

pub use message::QueuedMessage;
pub use reader::MessageQueueRepository;
