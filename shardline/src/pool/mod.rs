mod managed;
mod schema_cache;

use std::{sync::Arc, time::Instant};

pub use managed::{
    ManagedPool, PooledConnection, ShardManager, TrackedConnection,
};
pub use schema_cache::SchemaCache;
use tracing::{debug, info, warn};

use crate::{
    adapter::Adapter,
    conf::PoolSettings,
    error::{ShardError, ShardResult},
    server::{DatabaseServer, DbConfig, Environment, ResolvedConfig},
    shard::{Category, Shard, ShardId, ShardRegistry},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolTarget {
    /// Shared by every shard of a server; `None` is the default server.
    Server(Option<String>),
    Shard(ShardId),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub environment: Environment,
    pub target: PoolTarget,
}

/// A resolved pool. `key` is set when the pool may fail over to the
/// environment's other candidates.
struct Route<A: Adapter> {
    key: Option<PoolKey>,
    pool: Arc<ManagedPool<A>>,
}

/// Picks the pool serving the current shard of one category.
pub struct ConnectionRouter<A: Adapter> {
    category: Category,
    adapter: Arc<A>,
    registry: Arc<ShardRegistry>,
    settings: PoolSettings,
    username: Option<String>,
    default_pool: Arc<ManagedPool<A>>,
    pools: scc::HashMap<PoolKey, Arc<ManagedPool<A>>>,
    schema_cache: Arc<SchemaCache>,
}

impl<A: Adapter> ConnectionRouter<A> {
    /// `default_pool` is the process-wide pool of the default shard, shared
    /// with every other router.
    pub fn new(
        category: Category,
        adapter: Arc<A>,
        registry: Arc<ShardRegistry>,
        settings: PoolSettings,
        username: Option<String>,
        default_pool: Arc<ManagedPool<A>>,
    ) -> Self {
        let schema_cache = default_pool.schema_cache().clone();
        Self {
            category,
            adapter,
            registry,
            settings,
            username,
            default_pool,
            pools: scc::HashMap::new(),
            schema_cache,
        }
    }

    #[inline]
    pub fn category(&self) -> &Category {
        &self.category
    }

    pub fn default_pool(&self) -> &Arc<ManagedPool<A>> {
        &self.default_pool
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schema_cache
    }

    /// The pool serving the shard currently active for this category.
    pub fn current_pool(&self) -> ShardResult<Arc<ManagedPool<A>>> {
        let shard = self.registry.current(&self.category);
        self.pool_for(&shard)
    }

    pub fn pool_for(&self, shard: &Arc<Shard>) -> ShardResult<Arc<ManagedPool<A>>> {
        Ok(self.resolve(shard)?.pool)
    }

    fn resolve(&self, shard: &Arc<Shard>) -> ShardResult<Route<A>> {
        if !shard.is_default() && !self.registry.contains(shard) {
            return Err(ShardError::NonExistentShard(shard.id));
        }
        let server = self.registry.server_for(shard)?;
        let environment = server.environment();
        let shareable = server.shareable(self.username.as_deref());
        let on_default_server = server.id == self.registry.default_server_id();
        // an outage of the primary database is reported, never masked
        let failover =
            !(on_default_server && environment == Environment::PRIMARY);
        if !failover && (shard.is_default() || shareable) {
            return Ok(Route {
                key: None,
                pool: self.default_pool.clone(),
            });
        }

        let key = PoolKey {
            environment: environment.clone(),
            target: if shareable {
                PoolTarget::Server(
                    server.pool_key(self.registry.default_server_id()),
                )
            } else {
                PoolTarget::Shard(shard.id)
            },
        };
        let pool = match self.pools.read(&key, |_, p| p.clone()) {
            Some(pool) => pool,
            None => {
                let config = self.pool_config(
                    &server,
                    server.config(&environment).first(),
                    shard,
                    shareable,
                );
                let created = Arc::new(self.create_pool(config, shareable));
                match self.pools.entry(key.clone()) {
                    scc::hash_map::Entry::Occupied(o) => o.get().clone(),
                    scc::hash_map::Entry::Vacant(v) => {
                        debug!(
                            "new pool for {:?} in category '{}'",
                            key, self.category
                        );
                        v.insert_entry(created.clone());
                        created
                    }
                }
            }
        };
        Ok(Route {
            key: failover.then_some(key),
            pool,
        })
    }

    fn pool_config(
        &self,
        server: &DatabaseServer,
        base: &DbConfig,
        shard: &Shard,
        shareable: bool,
    ) -> DbConfig {
        let mut config = if shareable {
            base.clone()
        } else {
            base.for_shard(&shard_name(server, shard))
        };
        if let Some(user) = &self.username {
            config.username = Some(user.clone());
        }
        config
    }

    fn create_pool(&self, config: DbConfig, shared: bool) -> ManagedPool<A> {
        let pool = ManagedPool::new(
            self.adapter.clone(),
            config,
            self.settings,
            shared,
            self.schema_cache.clone(),
        );
        if self.default_pool.query_cache_enabled() {
            pool.enable_query_cache();
        }
        pool
    }

    /// Check out a connection for the current shard. With `switch_shard`
    /// the connection is pointed at the shard's schema first.
    pub async fn connection(
        &self,
        switch_shard: bool,
    ) -> ShardResult<PooledConnection<A>> {
        let shard = self.registry.current(&self.category);
        self.connection_for(&shard, switch_shard).await
    }

    pub async fn connection_for(
        &self,
        shard: &Arc<Shard>,
        switch_shard: bool,
    ) -> ShardResult<PooledConnection<A>> {
        let Route { key, pool } = self.resolve(shard)?;
        let mut conn = match pool.get(shard).await {
            Ok(conn) => conn,
            Err(e) if e.is_connection_error() => match key {
                Some(key) => self.fail_over(key, shard, e).await?,
                None => return Err(e),
            },
            Err(e) => return Err(e),
        };
        if switch_shard && conn.pool().is_shared() {
            let server = self.registry.server_for(shard)?;
            let name = shard.name.clone().or_else(|| server.shard_name());
            conn.switch_to(shard, name.as_deref()).await?;
        }
        Ok(conn)
    }

    /// Try each failover candidate of the key's environment in order and
    /// rebind the key to the first one that connects.
    async fn fail_over(
        &self,
        key: PoolKey,
        shard: &Arc<Shard>,
        error: ShardError,
    ) -> ShardResult<PooledConnection<A>> {
        let server = self.registry.server_for(shard)?;
        let candidates = match server.config(&key.environment) {
            ResolvedConfig::Candidates(list) => list,
            ResolvedConfig::Single(_) => return Err(error),
        };
        let shared = matches!(key.target, PoolTarget::Server(_));
        warn!(
            "connection to {:?} failed ({error}); trying {} candidates",
            key,
            candidates.len()
        );
        let mut last = error;
        for candidate in candidates.iter() {
            let config = self.pool_config(&server, candidate, shard, shared);
            let pool = Arc::new(self.create_pool(config, shared));
            match pool.get(shard).await {
                Ok(conn) => {
                    info!(
                        "rebind {:?} to host {:?}",
                        key,
                        pool.config().host
                    );
                    self.pools.upsert(key, pool);
                    return Ok(conn);
                }
                Err(e) => {
                    debug!("candidate {:?} failed: {e}", candidate.host);
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Every pool this router ever created plus the default pool, each once.
    pub fn pools(&self) -> Vec<Arc<ManagedPool<A>>> {
        let mut out = vec![self.default_pool.clone()];
        self.pools.scan(|_, p| {
            if !out.iter().any(|o| Arc::ptr_eq(o, p)) {
                out.push(p.clone());
            }
        });
        out
    }

    /// Number of pools besides the default one.
    pub fn pool_count(&self) -> usize {
        self.pools().len() - 1
    }

    pub fn disconnect_all(&self) {
        self.pools().iter().for_each(|p| p.disconnect());
    }

    pub fn flush_all(&self) {
        self.pools().iter().for_each(|p| p.flush());
    }

    pub fn clear_idle_connections_since(&self, since: Instant) {
        self.pools()
            .iter()
            .for_each(|p| p.clear_idle_connections_since(since));
    }

    pub fn verify_active_connections(&self) {
        self.pools()
            .iter()
            .for_each(|p| p.verify_active_connections());
    }

    pub fn enable_query_cache(&self) {
        self.pools().iter().for_each(|p| p.enable_query_cache());
    }

    pub fn disable_query_cache(&self) {
        self.pools().iter().for_each(|p| p.disable_query_cache());
    }

    /// Drop the pools of a shard that no longer exists.
    pub fn remove_shard(&self, shard_id: ShardId) {
        self.pools
            .retain(|k, _| k.target != PoolTarget::Shard(shard_id));
    }
}

/// The pool of the default shard: the default server's primary config,
/// shared by every shard that server can share a pool with.
pub fn default_pool<A: Adapter>(
    adapter: Arc<A>,
    registry: &ShardRegistry,
    settings: PoolSettings,
    username: Option<&str>,
    schema_cache: Arc<SchemaCache>,
) -> ManagedPool<A> {
    let server = registry.default_server();
    let mut config = server.config(&Environment::PRIMARY).first().clone();
    if let Some(user) = username {
        config.username = Some(user.to_string());
    }
    ManagedPool::new(adapter, config, settings, true, schema_cache)
}

/// The name substituted for `%{shard_name}` in a per-shard config.
fn shard_name(server: &DatabaseServer, shard: &Shard) -> String {
    shard
        .name
        .clone()
        .or_else(|| server.shard_name())
        .unwrap_or_else(|| format!("shard_{}", shard.id))
}
