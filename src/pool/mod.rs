//! The publishing side of the broker plumbing: pooled [`lapin::Channel`]s on top of pooled
//! [`lapin::Connection`]s, built on [`deadpool`] and used by
//! [`TopicPublisher`](crate::publishers::TopicPublisher).
//!
//! Broken channels and connections are dropped and re-created on demand. The pool also
//! remembers which topics were already declared, so each topic is declared once per pool
//! rather than once per message.
//!
//! Consumers do not use it: a [`Subscriber`](crate::consumers::Subscriber) settles its
//! deliveries on the channel they came from, so it owns that channel.
//!
//! ```rust
//! use carrot_relay::amqp::configuration::RabbitMqSettings;
//! use carrot_relay::amqp::ConnectionFactory;
//! use carrot_relay::pool::{publishing_pool, PoolSizes};
//!
//! async fn publishing_channel() -> anyhow::Result<()> {
//!     let settings = RabbitMqSettings::default();
//!     let channel_pool = publishing_pool(
//!         ConnectionFactory::new_from_config(&settings)?,
//!         PoolSizes::default(),
//!     )?;
//!
//!     let channel = channel_pool.get().await?;
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::{ChannelManager, ChannelPool, ConfirmMode};
pub use connection::ConnectionPool;
pub use error::PoolError;

use crate::amqp::ConnectionFactory;
use anyhow::Context;

/// How many connections, and channels across them, a publishing pool keeps open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub connections: usize,
    pub channels: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            connections: 2,
            channels: 10,
        }
    }
}

/// A pool of confirmed publishing channels. Use [`ChannelManager`] directly for other
/// confirm modes.
pub fn publishing_pool(
    connection_factory: ConnectionFactory,
    sizes: PoolSizes,
) -> Result<ChannelPool, anyhow::Error> {
    let connection_pool = ConnectionPool::builder(connection_factory)
        .max_size(sizes.connections)
        .build()
        .context("Failed to build the RabbitMq connection pool")?;
    ChannelPool::builder(ChannelManager::new(connection_pool))
        .max_size(sizes.channels)
        .build()
        .context("Failed to build the RabbitMq channel pool")
}
