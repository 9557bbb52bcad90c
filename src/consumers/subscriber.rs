use crate::amqp::{topology, ConnectionFactory};
use crate::consumers::{
    DeliveryConsumer, DeliveryConsumerBuilder, Handler, RetryObserver, SubscriptionInfo,
};
use amq_protocol_types::FieldTable;
use futures_util::{stream::FuturesUnordered, StreamExt};
use lapin::options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The reply code sent to the broker when closing the subscription channel.
const REPLY_SUCCESS: u16 = 200;

/// Consumes one subscription queue, processing every delivery with a [`DeliveryConsumer`].
///
/// A `Subscriber` owns its channel: deliveries are settled on the channel they came from.
/// Each delivery is processed in its own task, up to `max_messages_in_parallel` at a time
/// (the prefetch count of the channel).
///
/// Use [`Subscriber::builder`] to create one.
pub struct Subscriber<C, E> {
    channel: lapin::Channel,
    subscription: Arc<SubscriptionInfo>,
    consumer: DeliveryConsumer<C, E>,
}

impl<C, E> Subscriber<C, E>
where
    C: Send + Sync + 'static,
    E: fmt::Display + Send + Sync + 'static,
{
    pub fn builder(
        connection_factory: ConnectionFactory,
        subscription: SubscriptionInfo,
        // If the context is already behind an Arc pointer, we won't double-wrap it.
        context: impl Into<Arc<C>>,
    ) -> SubscriberBuilder<C, E> {
        let subscription = Arc::new(subscription);
        SubscriberBuilder {
            connection_factory,
            consumer: DeliveryConsumer::builder(Arc::clone(&subscription), context),
            subscription,
            declare_topology: true,
            cancellation: CancellationToken::new(),
        }
    }

    /// Cancelled when the subscriber shuts down.
    pub fn cancellation(&self) -> &CancellationToken {
        self.consumer.cancellation()
    }

    pub fn subscription(&self) -> &SubscriptionInfo {
        &self.subscription
    }

    /// Start consuming until `shutdown` is cancelled, the consumer is cancelled by the broker
    /// or the channel fails.
    ///
    /// On shutdown the subscriber stops receiving new deliveries, cancels the in-flight ones
    /// (which stay unacknowledged), waits for their tasks to complete and closes its channel.
    #[tracing::instrument(
        skip_all,
        name = "subscriber_run",
        fields(subscription = %self.subscription.subscription_name())
    )]
    pub async fn run_until_shutdown(self, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
        let mut consumer = self
            .channel
            .basic_consume(
                self.subscription.subscription_name(),
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions {
                    no_ack: self.subscription.auto_ack(),
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        tracing::info!("Subscriber started");

        let mut task_handles = FuturesUnordered::new();

        let result = 'event_loop: loop {
            tokio::select! {
                // Prefer handling the shutdown over processing more deliveries.
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("Subscriber received a shutdown signal");
                    self.consumer.cancellation().cancel();
                    if let Err(e) = self
                        .channel
                        .basic_cancel(consumer.tag().as_str(), BasicCancelOptions::default())
                        .await
                    {
                        tracing::warn!(error.message = %e, "Failed to cancel the broker consumer");
                    }
                    break 'event_loop Ok(());
                }

                // clear out some of our task handles
                _ = task_handles.next(), if !task_handles.is_empty() => {}

                event = consumer.next() => {
                    match event {
                        // The broker cancelled the consumer.
                        None => break 'event_loop Ok(()),
                        Some(Err(e)) => {
                            tracing::error!(error.message = %e, "Consumer error");
                            break 'event_loop Err(e.into());
                        }
                        Some(Ok(delivery)) => {
                            // Failing to process one message (even with a panic!) does not
                            // tear the whole subscriber down.
                            let consumer = self.consumer.clone();
                            task_handles.push(tokio::spawn(async move {
                                if let Err(e) = consumer.process(delivery.into()).await {
                                    tracing::error!(
                                        error.message = %e,
                                        error.details = ?e,
                                        "Failed to process a delivery"
                                    );
                                }
                            }));
                        }
                    }
                }
            }
        };

        // Make sure all tasks in flight complete before closing the channel.
        while task_handles.next().await.is_some() {}
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "Subscriber shut down").await {
            tracing::warn!(error.message = %e, "Failed to close the subscription channel");
        }
        tracing::info!("Subscriber stopped");

        result
    }

    /// [`Subscriber::run_until_shutdown`], shutting down on SIGTERM or Ctrl+C.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        let shutdown = CancellationToken::new();
        let signal_listener = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                shutdown.cancel();
            }
        });
        let result = self.run_until_shutdown(shutdown).await;
        signal_listener.abort();
        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error.message = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error.message = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Configures a [`Subscriber`].
///
/// Use [`Subscriber::builder`] to create one.
pub struct SubscriberBuilder<C, E> {
    connection_factory: ConnectionFactory,
    subscription: Arc<SubscriptionInfo>,
    consumer: DeliveryConsumerBuilder<C, E>,
    declare_topology: bool,
    cancellation: CancellationToken,
}

impl<C, E> SubscriberBuilder<C, E>
where
    C: Send + Sync + 'static,
    E: fmt::Display + Send + Sync + 'static,
{
    /// Only retry errors that satisfy `is_retryable`.
    ///
    /// The number of retries is [`SubscriptionInfo::retry_count`].
    pub fn retry_on<P>(mut self, is_retryable: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.consumer = self.consumer.retry_on(is_retryable);
        self
    }

    pub fn with_retry_observer(mut self, observer: impl RetryObserver<E>) -> Self {
        self.consumer = self.consumer.with_retry_observer(observer);
        self
    }

    /// Cancelled when the subscriber shuts down.
    ///
    /// Hand it to [`Aggregator::with_cancellation`](crate::consumers::Aggregator::with_cancellation)
    /// so that pending groups are released on shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Skip the topology declaration, e.g. when the queue is provisioned out of band.
    /// The prefetch count is applied regardless.
    pub fn skip_topology_declaration(mut self) -> Self {
        self.declare_topology = false;
        self
    }

    /// Open the subscription channel, declare the topology and return a ready-to-run
    /// subscriber.
    #[tracing::instrument(
        skip_all,
        name = "subscriber_new",
        fields(subscription = %self.subscription.subscription_name())
    )]
    pub async fn build(self, handler: impl Handler<C, E>) -> Result<Subscriber<C, E>, anyhow::Error> {
        let channel = self.connection_factory.new_channel().await?;
        if self.declare_topology {
            topology::declare_topology(&channel, &self.subscription).await?;
        } else {
            channel
                .basic_qos(
                    self.subscription.max_messages_in_parallel(),
                    BasicQosOptions { global: false },
                )
                .await?;
        }

        let consumer = self
            .consumer
            .cancellation(self.cancellation)
            .build(channel.clone(), handler);
        Ok(Subscriber {
            channel,
            subscription: self.subscription,
            consumer,
        })
    }
}
