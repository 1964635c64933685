use std::{
    sync::{Arc, OnceLock},
    time::Instant,
};

use tracing::info;

use crate::{
    adapter::{Adapter, Connection},
    conf::SwitchboardConfig,
    error::{ShardError, ShardResult},
    pool::{self, ConnectionRouter, ManagedPool, PooledConnection, SchemaCache},
    server::{DatabaseServer, ServersFile, ShardingConfig},
    shard::{Category, Shard, ShardRegistry},
};

/// Entry point tying the shard registry to one connection router per
/// category.
pub struct Switchboard<A: Adapter> {
    adapter: Arc<A>,
    registry: Arc<ShardRegistry>,
    config: SwitchboardConfig,
    sharding: ShardingConfig,
    default_pool: OnceLock<Arc<ManagedPool<A>>>,
    schema_cache: Arc<SchemaCache>,
    routers: scc::HashMap<Category, Arc<ConnectionRouter<A>>>,
}

impl<A: Adapter> Switchboard<A> {
    pub fn new(
        adapter: A,
        registry: ShardRegistry,
        config: SwitchboardConfig,
    ) -> Self {
        Self {
            adapter: Arc::new(adapter),
            registry: Arc::new(registry),
            config,
            sharding: ShardingConfig::default(),
            default_pool: OnceLock::new(),
            schema_cache: Arc::new(SchemaCache::new()),
            routers: scc::HashMap::new(),
        }
    }

    /// Register every server of `file`; `default_server` hosts the shard
    /// table.
    pub fn from_servers(
        adapter: A,
        file: ServersFile,
        default_server: &str,
        config: SwitchboardConfig,
    ) -> ShardResult<Self> {
        let ServersFile { sharding, servers } = file;
        let mut servers: Vec<_> = servers.into_iter().collect();
        let index = servers
            .iter()
            .position(|(id, _)| id == default_server)
            .ok_or_else(|| ShardError::NonExistentServer(default_server.into()))?;
        let (id, default_config) = servers.remove(index);
        let registry = ShardRegistry::new(DatabaseServer::new(id, default_config));
        for (id, server_config) in servers {
            registry.add_server(DatabaseServer::new(id, server_config));
        }
        Ok(Self::new(adapter, registry, config).with_sharding(sharding))
    }

    pub fn with_sharding(mut self, sharding: ShardingConfig) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SwitchboardConfig {
        &self.config
    }

    pub fn sharding(&self) -> &ShardingConfig {
        &self.sharding
    }

    pub fn current(&self, category: &Category) -> Arc<Shard> {
        self.registry.current(category)
    }

    pub fn in_clause_length(&self) -> usize {
        self.config
            .in_clause_length
            .unwrap_or_else(|| self.adapter.in_clause_length())
            .max(1)
    }

    /// The pool of the default shard, shared by every router.
    pub fn default_pool(&self) -> &Arc<ManagedPool<A>> {
        self.default_pool.get_or_init(|| {
            Arc::new(pool::default_pool(
                self.adapter.clone(),
                &self.registry,
                self.config.pool_settings(),
                self.config.username.as_deref(),
                self.schema_cache.clone(),
            ))
        })
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schema_cache
    }

    /// The router of `category`, created on first use.
    pub fn router(&self, category: &Category) -> Arc<ConnectionRouter<A>> {
        if let Some(router) = self.routers.read(category, |_, r| r.clone()) {
            return router;
        }
        self.routers
            .entry(category.clone())
            .or_insert_with(|| {
                Arc::new(ConnectionRouter::new(
                    category.clone(),
                    self.adapter.clone(),
                    self.registry.clone(),
                    self.config.pool_settings(),
                    self.config.username.clone(),
                    self.default_pool().clone(),
                ))
            })
            .get()
            .clone()
    }

    pub fn routers(&self) -> Vec<Arc<ConnectionRouter<A>>> {
        let mut out = Vec::with_capacity(self.routers.len());
        self.routers.scan(|_, r| out.push(r.clone()));
        out
    }

    /// A connection for the shard currently active in `category`.
    pub async fn connection(
        &self,
        category: &Category,
        switch_shard: bool,
    ) -> ShardResult<PooledConnection<A>> {
        self.router(category).connection(switch_shard).await
    }

    /// A connection to the default shard, where the shard table lives.
    pub async fn default_connection(&self) -> ShardResult<PooledConnection<A>> {
        let default = self.registry.default_shard();
        self.router(&Category::UNSHARDED)
            .connection_for(&default, false)
            .await
    }

    /// Read the shard table and register every row.
    pub async fn reload_shards(&self) -> ShardResult<Vec<Arc<Shard>>> {
        let mut conn = self.default_connection().await?;
        let rows = conn.list_shards().await.map_err(ShardError::from_driver)?;
        info!("load {} shards", rows.len());
        self.registry.load(rows);
        Ok(self.registry.shards())
    }

    /// The default pool and every pool of every router, each once.
    pub fn pools(&self) -> Vec<Arc<ManagedPool<A>>> {
        let mut out = vec![self.default_pool().clone()];
        for router in self.routers() {
            for pool in router.pools() {
                if !out.iter().any(|p| Arc::ptr_eq(p, &pool)) {
                    out.push(pool);
                }
            }
        }
        out
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

    pub fn clear_schema_cache(&self) {
        self.schema_cache.clear();
    }
}
