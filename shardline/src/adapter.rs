//! The driver contract the router and provisioning run against.

use crate::{
    server::{AdapterKind, DbConfig},
    shard::{NewShard, Shard, ShardId},
};

/// A driver error. Connection-level failures are the only ones the router
/// fails over on.
pub trait DriverError: std::error::Error + Send + Sync + 'static {
    fn is_connection_error(&self) -> bool;
}

#[async_trait::async_trait]
pub trait Adapter: Send + Sync + 'static {
    type Connection: Connection<Error = Self::Error>;
    type Error: DriverError;

    fn kind(&self) -> AdapterKind;

    async fn connect(
        &self,
        config: &DbConfig,
    ) -> Result<Self::Connection, Self::Error>;

    async fn ping(&self, conn: &mut Self::Connection) -> Result<(), Self::Error>;

    /// Point `conn` at the schema (or database) of another shard on the
    /// same server.
    async fn switch_schema(
        &self,
        conn: &mut Self::Connection,
        name: &str,
    ) -> Result<(), Self::Error>;

    /// Largest number of keys a single `IN (...)` list may hold.
    fn in_clause_length(&self) -> usize {
        1000
    }

    fn supports_ddl_transactions(&self) -> bool {
        false
    }

    /// Whether the shard table allocates ids from a sequence.
    fn supports_sequences(&self) -> bool {
        false
    }
}

#[async_trait::async_trait]
pub trait Connection: Send + 'static {
    type Error: DriverError;

    async fn execute(&mut self, statement: &str) -> Result<u64, Self::Error>;

    async fn schema_exists(&mut self, name: &str) -> Result<bool, Self::Error>;

    async fn next_shard_id(&mut self) -> Result<ShardId, Self::Error>;

    async fn insert_shard(&mut self, row: &NewShard) -> Result<Shard, Self::Error>;

    async fn delete_shard(&mut self, id: ShardId) -> Result<(), Self::Error>;

    async fn list_shards(&mut self) -> Result<Vec<Shard>, Self::Error>;

    async fn begin(&mut self) -> Result<(), Self::Error>;

    async fn commit(&mut self) -> Result<(), Self::Error>;

    async fn rollback(&mut self) -> Result<(), Self::Error>;
}
