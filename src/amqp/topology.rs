//! Declares the broker objects a subscription relies on.
//!
//! For a subscription `S` on topic `T` with dead-letter topic `D`:
//!
//! ```text
//! T (direct) --"general"--> S
//!            --"S"--------> S          (used to replay a message to S only)
//! S --x-dead-letter-exchange--> D (fanout) --> D-DefaultQueue
//! ```
//!
//! Durable subscriptions are backed by quorum queues: the broker tracks the
//! `x-delivery-count` header the consumer relies on to enforce the dead-letter budget.
use crate::consumers::{SubscriptionInfo, TopicInfo};
use amq_protocol_types::{AMQPValue, FieldTable, LongString};
use lapin::options::{BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::{Channel, ExchangeKind};

/// The routing key every subscription of a topic is bound with.
pub const GENERAL_ROUTING_KEY: &str = "general";

/// The name of the queue collecting the messages routed to a dead-letter topic.
pub fn dead_letter_queue_name(dead_letter_topic: &str) -> String {
    format!("{dead_letter_topic}-DefaultQueue")
}

/// Declare the direct exchange backing a topic. Idempotent.
pub async fn declare_topic(channel: &Channel, topic: &TopicInfo) -> Result<(), anyhow::Error> {
    channel
        .exchange_declare(
            topic.name(),
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                passive: false,
                durable: topic.durable(),
                auto_delete: topic.auto_delete(),
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// Declare the topic, the dead-letter topic (if any), the subscription queue and its
/// bindings, then apply the subscription prefetch to `channel`.
#[tracing::instrument(
    name = "declare_topology",
    skip_all,
    fields(exchange = %subscription.topic().name(), subscription = %subscription.subscription_name())
)]
pub async fn declare_topology(
    channel: &Channel,
    subscription: &SubscriptionInfo,
) -> Result<(), anyhow::Error> {
    declare_topic(channel, subscription.topic()).await?;
    if let Some(dead_letter) = subscription.dead_letter_topic() {
        declare_dead_letter_topic(channel, dead_letter.name()).await?;
    }

    let queue_name = subscription.subscription_name();
    channel
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                passive: false,
                durable: !subscription.temporary(),
                exclusive: false,
                auto_delete: subscription.temporary(),
                nowait: false,
            },
            queue_arguments(subscription),
        )
        .await?;

    for routing_key in [GENERAL_ROUTING_KEY, queue_name] {
        channel
            .queue_bind(
                queue_name,
                subscription.topic().name(),
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await?;
    }

    channel
        .basic_qos(
            subscription.max_messages_in_parallel(),
            BasicQosOptions { global: false },
        )
        .await?;

    tracing::info!("Topology declared");
    Ok(())
}

async fn declare_dead_letter_topic(channel: &Channel, name: &str) -> Result<(), anyhow::Error> {
    channel
        .exchange_declare(
            name,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                passive: false,
                durable: true,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await?;

    let queue_name = dead_letter_queue_name(name);
    let mut arguments = FieldTable::default();
    arguments.insert("x-queue-type".into(), quorum());
    channel
        .queue_declare(
            &queue_name,
            QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            arguments,
        )
        .await?;
    channel
        .queue_bind(
            &queue_name,
            name,
            "",
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// The `x-*` arguments of the subscription queue.
pub fn queue_arguments(subscription: &SubscriptionInfo) -> FieldTable {
    let mut arguments = FieldTable::default();
    if !subscription.temporary() {
        arguments.insert("x-queue-type".into(), quorum());
    }
    if let Some(dead_letter) = subscription.dead_letter_topic() {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dead_letter.name().into()),
        );
    }
    arguments
}

fn quorum() -> AMQPValue {
    AMQPValue::LongString(LongString::from("quorum"))
}
