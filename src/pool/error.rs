/// Raised when the pool cannot hand out a publishing channel.
#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("Failed to connect to the RabbitMq broker")]
    Connect(#[source] anyhow::Error),
    #[error("No RabbitMq connection is available: {0}")]
    ConnectionUnavailable(String),
    #[error("Failed to open a channel on a pooled connection")]
    OpenChannel(#[source] lapin::Error),
    #[error("Failed to put a new channel in confirm mode")]
    ConfirmSelect(#[source] lapin::Error),
}

// A channel cannot be opened without a connection: surface the connection failure as is.
impl From<deadpool::managed::PoolError<PoolError>> for PoolError {
    fn from(err: deadpool::managed::PoolError<PoolError>) -> Self {
        match err {
            deadpool::managed::PoolError::Backend(e) => e,
            err => Self::ConnectionUnavailable(err.to_string()),
        }
    }
}
