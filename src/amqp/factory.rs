use crate::amqp::configuration::RabbitMqSettings;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: std::time::Duration,
    client_name: Option<String>,
    /// If `None`, the connection is not encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Build a connection factory out of validated settings.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        settings.validate()?;
        let tls = match &settings.tls {
            None => None,
            Some(tls_settings) => {
                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                Some(Arc::new(Tls {
                    connector: connector_builder.build()?,
                    domain_name: tls_settings
                        .domain
                        .clone()
                        .unwrap_or_else(|| settings.host.clone()),
                }))
            }
        };
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings.connection_timeout(),
            client_name: settings.client_name.clone(),
            tls,
        })
    }

    /// Create a new connection to the broker, encrypted if TLS was configured.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(host = %self.uri.authority.host))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let mut properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        if let Some(client_name) = &self.client_name {
            properties = properties.with_connection_name(client_name.clone().into());
        }
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await??;
        connection.on_error(|e| {
            warn!(error = ?e, "RabbitMQ broken connection");
        });
        Ok(connection)
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then a TLS handshake against the expected domain.
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain_name))
            }),
            properties,
        )
        .await
    }

    /// Open a dedicated connection and a channel on top of it.
    ///
    /// Subscribers own their channel: acks have to go back through the channel the
    /// delivery came from.
    pub async fn new_channel(&self) -> Result<lapin::Channel, anyhow::Error> {
        Ok(self.new_connection().await?.create_channel().await?)
    }
}
