use super::PoolError;
use crate::amqp::ConnectionFactory;
use deadpool::managed::{self, Manager};
use lapin::{Connection, ConnectionState};

/// The connections publishing channels are opened on, each opened by the
/// [`ConnectionFactory`] (hence with its timeout and TLS settings).
pub type ConnectionPool = deadpool::managed::Pool<ConnectionFactory>;

#[async_trait::async_trait]
impl Manager for ConnectionFactory {
    type Type = Connection;
    type Error = PoolError;

    async fn create(&self) -> Result<Connection, PoolError> {
        self.new_connection().await.map_err(PoolError::Connect)
    }

    // A connection the broker closed (or lost) takes its channels down with it: it is
    // dropped and the next channel is opened on a fresh one.
    async fn recycle(&self, connection: &mut Connection) -> managed::RecycleResult<PoolError> {
        match connection.status().state() {
            ConnectionState::Connected => Ok(()),
            state => {
                tracing::warn!(?state, "Dropping a broken RabbitMq connection from the pool");
                Err(managed::RecycleError::Message(format!(
                    "The connection is {state:?}"
                )))
            }
        }
    }
}
