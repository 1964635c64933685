//! Horizontal sharding over relational databases: shard-local keys mapped
//! to a global keyspace, a per-task current shard for each category, pools
//! routed by shard and environment, and associations loaded across shards.

pub mod adapter;
pub mod assoc;
pub mod conf;
pub mod context;
mod error;
pub mod id;
pub mod memory;
pub mod pool;
pub mod record;
pub mod server;
pub mod shard;
mod switchboard;

pub use adapter::{Adapter, Connection, DriverError};
pub use conf::{PoolSettings, SwitchboardConfig};
pub use error::{ShardError, ShardResult};
pub use id::IDS_PER_SHARD;
pub use server::{
    DatabaseServer, Environment, Migrator, NoopMigrator, ProvisionOptions,
    ServerConfig, ServersFile, StatementMigrator,
};
pub use shard::{Category, Shard, ShardId, ShardRegistry};
pub use switchboard::Switchboard;
