//! `carrot-relay` is a reliability layer for RabbitMQ consumers, built on top of [`lapin`].
//!
//! It turns raw, possibly redelivered, deliveries into application outcomes and turns those
//! outcomes back into acknowledgement decisions:
//!
//! - handlers are retried on the errors you choose, up to the subscription retry budget;
//! - failed messages are requeued until the dead-letter budget of the subscription is spent,
//!   then routed to its dead-letter topic;
//! - related messages can be grouped and processed as a single batch, each of them settled
//!   with the outcome of its batch.
//!
//! [`Subscriber`](crate::consumers::Subscriber) and
//! [`TopicPublisher`](crate::publishers::TopicPublisher) are the best starting points;
//! [`MessageQueueRepository`](crate::repository::MessageQueueRepository) reads what is left
//! in a queue, e.g. dead-lettered messages.

pub mod consumers;
pub mod publishers;

pub mod amqp;
pub mod pool;
pub mod repository;
