use amq_protocol_types::DeliveryTag;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};

/// The terminal broker calls used to settle a delivery.
///
/// It is implemented for [`lapin::Channel`]; tests plug in a recording fake.
/// The [`DeliveryConsumer`](crate::consumers::DeliveryConsumer) serializes calls, so
/// implementations do not need to be re-entrant.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), anyhow::Error>;

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl Acknowledger for lapin::Channel {
    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<(), anyhow::Error> {
        self.basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), anyhow::Error> {
        self.basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), anyhow::Error> {
        self.basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }
}
