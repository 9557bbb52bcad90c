//! Helpers for connecting to a RabbitMq broker and setting up the objects a subscription needs.

pub mod configuration;
pub mod convenience;
mod factory;
pub mod topology;

pub use factory::ConnectionFactory;
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties};
