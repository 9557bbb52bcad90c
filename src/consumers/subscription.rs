//! The immutable description of what a [`Subscriber`](crate::consumers::Subscriber) consumes
//! and how it settles messages.

/// Default number of unacknowledged deliveries a subscription is allowed to hold.
pub const DEFAULT_MAX_MESSAGES_IN_PARALLEL: u16 = 30;

/// Raised when a topic or a subscription is built with invalid parameters.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidSubscription {
    #[error("The topic name must not be blank.")]
    BlankTopicName,
    #[error("The subscription name must not be blank.")]
    BlankSubscriptionName,
    #[error("The dead letter topic name must not be blank.")]
    BlankDeadLetterTopicName,
}

/// A topic, i.e. the exchange publishers send messages to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicInfo {
    name: String,
    durable: bool,
    auto_delete: bool,
}

impl TopicInfo {
    /// A durable topic that is never deleted automatically.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidSubscription> {
        Self::with_options(name, true, false)
    }

    pub fn with_options(
        name: impl Into<String>,
        durable: bool,
        auto_delete: bool,
    ) -> Result<Self, InvalidSubscription> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(InvalidSubscription::BlankTopicName);
        }
        Ok(Self {
            name,
            durable,
            auto_delete,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }
}

/// Where messages go once their redelivery budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeadLetterTopicInfo {
    name: String,
    max_retries: u16,
}

impl DeadLetterTopicInfo {
    pub fn new(name: impl Into<String>, max_retries: u16) -> Result<Self, InvalidSubscription> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(InvalidSubscription::BlankDeadLetterTopicName);
        }
        Ok(Self { name, max_retries })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many redeliveries a message gets before it is no longer requeued.
    pub fn max_retries(&self) -> u16 {
        self.max_retries
    }
}

/// Everything a subscriber needs to know about the queue it consumes from.
///
/// `SubscriptionInfo` is validated when built and immutable afterwards.
/// Use [`SubscriptionInfo::builder`] to customise the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    topic: TopicInfo,
    subscription_name: String,
    max_messages_in_parallel: u16,
    auto_ack: bool,
    temporary: bool,
    retry_count: u32,
    dead_letter_topic: Option<DeadLetterTopicInfo>,
}

impl SubscriptionInfo {
    /// A subscription with default settings: 30 messages in parallel, manual acks,
    /// a durable queue, no in-process retries and no dead-letter topic.
    pub fn new(
        topic: TopicInfo,
        subscription_name: impl Into<String>,
    ) -> Result<Self, InvalidSubscription> {
        Self::builder(topic, subscription_name).build()
    }

    pub fn builder(
        topic: TopicInfo,
        subscription_name: impl Into<String>,
    ) -> SubscriptionInfoBuilder {
        SubscriptionInfoBuilder {
            topic,
            subscription_name: subscription_name.into(),
            max_messages_in_parallel: DEFAULT_MAX_MESSAGES_IN_PARALLEL,
            auto_ack: false,
            temporary: false,
            retry_count: 0,
            dead_letter_topic: None,
        }
    }

    pub fn topic(&self) -> &TopicInfo {
        &self.topic
    }

    /// The name of the queue backing this subscription.
    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    /// The prefetch count applied to the subscription channel.
    pub fn max_messages_in_parallel(&self) -> u16 {
        self.max_messages_in_parallel
    }

    /// If `true`, the broker considers messages settled as soon as they are delivered.
    pub fn auto_ack(&self) -> bool {
        self.auto_ack
    }

    /// Temporary subscriptions use a classic, non-durable, auto-deleted queue.
    pub fn temporary(&self) -> bool {
        self.temporary
    }

    /// How many times a failing handler is retried in-process before giving up.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn dead_letter_topic(&self) -> Option<&DeadLetterTopicInfo> {
        self.dead_letter_topic.as_ref()
    }
}

/// A fluent builder for [`SubscriptionInfo`].
#[derive(Debug, Clone)]
pub struct SubscriptionInfoBuilder {
    topic: TopicInfo,
    subscription_name: String,
    max_messages_in_parallel: u16,
    auto_ack: bool,
    temporary: bool,
    retry_count: u32,
    dead_letter_topic: Option<DeadLetterTopicInfo>,
}

impl SubscriptionInfoBuilder {
    #[must_use]
    pub fn max_messages_in_parallel(mut self, max_messages_in_parallel: u16) -> Self {
        self.max_messages_in_parallel = max_messages_in_parallel;
        self
    }

    #[must_use]
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    #[must_use]
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    #[must_use]
    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    #[must_use]
    pub fn dead_letter_topic(mut self, dead_letter_topic: DeadLetterTopicInfo) -> Self {
        self.dead_letter_topic = Some(dead_letter_topic);
        self
    }

    pub fn build(self) -> Result<SubscriptionInfo, InvalidSubscription> {
        if self.subscription_name.trim().is_empty() {
            return Err(InvalidSubscription::BlankSubscriptionName);
        }
        Ok(SubscriptionInfo {
            topic: self.topic,
            subscription_name: self.subscription_name,
            max_messages_in_parallel: self.max_messages_in_parallel,
            auto_ack: self.auto_ack,
            temporary: self.temporary,
            retry_count: self.retry_count,
            dead_letter_topic: self.dead_letter_topic,
        })
    }
}
