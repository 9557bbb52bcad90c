use super::{ConnectionPool, PoolError};
use crate::amqp::topology::declare_topic;
use crate::consumers::TopicInfo;
use dashmap::DashSet;
use deadpool::managed::{self, Manager};
use lapin::{options::ConfirmSelectOptions, Channel, ChannelState};

/// A pool of publishing [`Channel`]s.
pub type ChannelPool = deadpool::managed::Pool<ChannelManager>;

/// How [`TopicPublisher`](crate::publishers::TopicPublisher) hands messages over to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmMode {
    /// Channels are in confirm mode and messages are published as `mandatory`: a publication
    /// completes once the broker took ownership of the message, and fails if no queue is bound
    /// to receive it.
    #[default]
    Confirmed,
    /// Fire and forget: unroutable messages are silently dropped by the broker.
    Unconfirmed,
}

impl ConfirmMode {
    /// Whether the broker must return messages it cannot route.
    pub fn mandatory(self) -> bool {
        matches!(self, Self::Confirmed)
    }
}

/// Opens publishing channels on pooled connections and keeps track of the topics declared
/// through them.
///
/// Exchanges are broker-wide: once a topic was declared on one channel of the pool, the
/// other channels publish to it straight away.
pub struct ChannelManager {
    connection_pool: ConnectionPool,
    confirm_mode: ConfirmMode,
    declared_topics: DashSet<TopicInfo>,
}

impl ChannelManager {
    pub fn new(connection_pool: ConnectionPool) -> Self {
        Self {
            connection_pool,
            confirm_mode: ConfirmMode::default(),
            declared_topics: DashSet::new(),
        }
    }

    /// Publish without waiting for broker confirmations (and without the mandatory flag).
    pub fn without_publisher_confirmations(mut self) -> Self {
        self.confirm_mode = ConfirmMode::Unconfirmed;
        self
    }

    pub fn confirm_mode(&self) -> ConfirmMode {
        self.confirm_mode
    }

    /// Declare `topic` on `channel`, unless it was already declared through this pool.
    pub(crate) async fn ensure_topic(
        &self,
        channel: &Channel,
        topic: &TopicInfo,
    ) -> Result<(), anyhow::Error> {
        if self.is_declared(topic) {
            return Ok(());
        }
        declare_topic(channel, topic).await?;
        tracing::debug!(exchange = %topic.name(), "Topic declared");
        self.declared_topics.insert(topic.clone());
        Ok(())
    }

    /// The next publication to `topic` declares it again, e.g. after the broker deleted an
    /// auto-delete topic.
    pub(crate) fn forget_topic(&self, topic: &TopicInfo) {
        self.declared_topics.remove(topic);
    }

    pub(crate) fn is_declared(&self, topic: &TopicInfo) -> bool {
        self.declared_topics.contains(topic)
    }
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Type = Channel;
    type Error = PoolError;

    async fn create(&self) -> Result<Channel, PoolError> {
        let connection = self.connection_pool.get().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(PoolError::OpenChannel)?;
        if self.confirm_mode == ConfirmMode::Confirmed {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(PoolError::ConfirmSelect)?;
        }
        tracing::debug!(
            channel_id = channel.id(),
            confirm_mode = ?self.confirm_mode,
            "Publishing channel opened"
        );
        Ok(channel)
    }

    // The broker closes a channel on any channel-level error (e.g. publishing to a missing
    // exchange): such channels are never handed out again.
    async fn recycle(&self, channel: &mut Channel) -> managed::RecycleResult<PoolError> {
        match channel.status().state() {
            ChannelState::Connected => Ok(()),
            state => {
                tracing::warn!(
                    channel_id = channel.id(),
                    ?state,
                    "Dropping a broken publishing channel from the pool"
                );
                Err(managed::RecycleError::Message(format!(
                    "The channel is {state:?}"
                )))
            }
        }
    }
}
