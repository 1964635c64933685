use std::error::Error;

use crate::shard::ShardId;

#[derive(thiserror::Error, Debug)]
pub enum ShardError {
    #[error("No shard `{0}` is registered")]
    NonExistentShard(ShardId),
    #[error("No database server `{0}` is configured")]
    NonExistentServer(String),
    #[error("Domain error: {0}")]
    Domain(String),
    #[error("Connection error: {0}")]
    Connection(Box<dyn Error + Send + Sync + 'static>),
    #[error("Driver error: {0}")]
    Driver(Box<dyn Error + Send + Sync + 'static>),
    #[error("Timeout while waiting for a pooled connection")]
    Timeout,
    #[error("BadConn")]
    BadConn,
    #[error("PoolClosed")]
    PoolClosed,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Schema `{0}` already exists; cannot overwrite")]
    SchemaExists(String),
    #[error("Invalid: {0}")]
    InvalidArgument(String),
}

impl ShardError {
    pub fn domain<T: ToString>(msg: T) -> Self {
        Self::Domain(msg.to_string())
    }

    pub fn config<T: ToString>(msg: T) -> Self {
        Self::Config(msg.to_string())
    }

    /// Wrap a driver error, keeping connection-level failures apart so the
    /// router can recognise them.
    pub fn from_driver<E>(error: E) -> Self
    where
        E: crate::adapter::DriverError,
    {
        if error.is_connection_error() {
            ShardError::Connection(Box::new(error))
        } else {
            ShardError::Driver(Box::new(error))
        }
    }

    #[inline]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, ShardError::Connection(_))
    }
}

impl<E: crate::adapter::DriverError> From<mobc::Error<E>> for ShardError {
    fn from(value: mobc::Error<E>) -> Self {
        match value {
            mobc::Error::Inner(e) => ShardError::from_driver(e),
            mobc::Error::Timeout => ShardError::Timeout,
            mobc::Error::BadConn => ShardError::BadConn,
            mobc::Error::PoolClosed => ShardError::PoolClosed,
        }
    }
}

pub type ShardResult<T> = Result<T, ShardError>;
