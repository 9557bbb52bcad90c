use super::QueuedMessage;
use crate::amqp::ConnectionFactory;
use lapin::options::BasicGetOptions;

/// The reply code sent to the broker when closing the inspection connection.
const REPLY_SUCCESS: u16 = 200;

/// Reads the messages waiting in a queue.
///
/// Messages are fetched with `basic.get` and never acknowledged: they go back to the queue
/// when the dedicated connection used for the read is closed.
/// Reading a queue increments the `x-delivery-count` of its messages, hence it counts
/// towards their dead-letter budget on quorum queues.
///
/// ```rust,no_run
/// use carrot_relay::amqp::configuration::RabbitMqSettings;
/// use carrot_relay::amqp::ConnectionFactory;
/// use carrot_relay::amqp::topology::dead_letter_queue_name;
/// use carrot_relay::repository::MessageQueueRepository;
///
/// async fn dead_letters() -> anyhow::Result<()> {
///     let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
///     let repository = MessageQueueRepository::new(factory);
///     for message in repository.get_messages(&dead_letter_queue_name("payments-DLE")).await? {
///         println!("{:?}: {}", message.message_id, message.body);
///     }
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct MessageQueueRepository {
    connection_factory: ConnectionFactory,
}

impl MessageQueueRepository {
    pub fn new(connection_factory: ConnectionFactory) -> Self {
        Self { connection_factory }
    }

    /// Every message currently waiting in `queue_name`, oldest first.
    #[tracing::instrument(name = "get_queued_messages", skip(self))]
    pub async fn get_messages(&self, queue_name: &str) -> Result<Vec<QueuedMessage>, anyhow::Error> {
        // A dedicated connection: closing it is what puts the messages back.
        let connection = self.connection_factory.new_connection().await?;
        let result = async {
            let channel = connection.create_channel().await?;
            let mut messages = vec![];
            while let Some(message) = channel
                .basic_get(queue_name, BasicGetOptions { no_ack: false })
                .await?
            {
                messages.push(QueuedMessage::from(message));
            }
            Ok::<_, anyhow::Error>(messages)
        }
        .await;

        if let Err(e) = connection.close(REPLY_SUCCESS, "Queue inspected").await {
            tracing::warn!(error.message = %e, "Failed to close the inspection connection");
        }
        if let Ok(messages) = &result {
            tracing::info!(message_count = messages.len(), "Queue inspected");
        }
        result
    }
}
