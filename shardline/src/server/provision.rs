use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    adapter::{Adapter, Connection},
    context,
    error::{ShardError, ShardResult},
    pool::PooledConnection,
    server::{DatabaseServer, Environment},
    shard::{Category, MEMORY_SHARD_NAME, NewShard, Shard, ShardId},
    switchboard::Switchboard,
};

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub id: Option<ShardId>,
    pub name: Option<String>,
    /// Run migrations against the new shard.
    pub schema: bool,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            id: None,
            name: None,
            schema: true,
        }
    }
}

impl ProvisionOptions {
    pub fn with_id(mut self, id: ShardId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn without_schema(mut self) -> Self {
        self.schema = false;
        self
    }
}

/// Brings a freshly created shard namespace up to the current schema.
#[async_trait::async_trait]
pub trait Migrator<A: Adapter>: Send + Sync {
    async fn migrate(&self, conn: &mut PooledConnection<A>) -> ShardResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMigrator;

#[async_trait::async_trait]
impl<A: Adapter> Migrator<A> for NoopMigrator {
    async fn migrate(&self, _conn: &mut PooledConnection<A>) -> ShardResult<()> {
        Ok(())
    }
}

/// Runs a fixed list of statements in order.
#[derive(Debug, Clone, Default)]
pub struct StatementMigrator {
    statements: Vec<String>,
}

impl StatementMigrator {
    pub fn new<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait::async_trait]
impl<A: Adapter> Migrator<A> for StatementMigrator {
    async fn migrate(&self, conn: &mut PooledConnection<A>) -> ShardResult<()> {
        for statement in &self.statements {
            conn.execute(statement)
                .await
                .map_err(ShardError::from_driver)?;
        }
        Ok(())
    }
}

impl<A: Adapter> Switchboard<A> {
    /// Create, migrate and register a new shard on `server_id`, or on a
    /// server picked by [`ShardRegistry::server_for_new_shard`] when none is
    /// given.
    ///
    /// On the default server, once it already hosts a shard, everything runs
    /// in one transaction on the shard table's connection and a failure
    /// rolls it back. Otherwise a failure removes the shard row. Either way
    /// the namespace is dropped unless it existed beforehand, and cleanup
    /// errors are swallowed so the original error is what the caller sees.
    ///
    /// [`ShardRegistry::server_for_new_shard`]: crate::shard::ShardRegistry::server_for_new_shard
    pub async fn provision_shard<M: Migrator<A>>(
        &self,
        server_id: Option<&str>,
        options: ProvisionOptions,
        migrator: &M,
    ) -> ShardResult<Arc<Shard>> {
        let server = match server_id {
            Some(id) => self.registry().server(id)?,
            None => self.registry().server_for_new_shard(),
        };
        let other_shard = self
            .registry()
            .shards_on(&server.id)
            .into_iter()
            .find(|s| s.name.as_deref() != Some(MEMORY_SHARD_NAME));
        let shareable = server.shareable(self.config().username.as_deref());
        let keep_pool = shareable && other_shard.is_some();
        let transactional = keep_pool
            && self.adapter().supports_ddl_transactions()
            && server.id == self.registry().default_server_id();

        let mut registry_conn = self.default_connection().await?;
        if transactional {
            registry_conn.begin().await.map_err(ShardError::from_driver)?;
        }
        let (shard, name) =
            match self.insert_row(&server, &options, &mut registry_conn).await {
                Ok(inserted) => inserted,
                Err(e) => {
                    if transactional {
                        rollback(&mut registry_conn).await;
                    }
                    return Err(e);
                }
            };
        info!("provision shard {} ('{}') on '{}'", shard.id, name, server.id);

        let built = if transactional {
            self.build_in_transaction(
                &mut registry_conn,
                &server,
                &shard,
                &name,
                options.schema,
                migrator,
            )
            .await
        } else {
            self.build_shard(
                &server,
                &shard,
                &name,
                options.schema,
                migrator,
                keep_pool,
            )
            .await
        };
        let built = match built {
            Ok(()) if transactional => registry_conn
                .commit()
                .await
                .map_err(ShardError::from_driver),
            other => other,
        };
        if let Err(e) = &built {
            warn!("provisioning shard {} failed: {e}", shard.id);
            if transactional {
                rollback(&mut registry_conn).await;
            } else if let Err(cleanup) =
                registry_conn.delete_shard(shard.id).await
            {
                warn!("cannot delete shard row {}: {cleanup}", shard.id);
            }
        }
        // left on the new namespace when there was no name to switch back to
        if registry_conn.schema() == Some(name.as_str()) {
            if let Err(e) = registry_conn.reset().await {
                warn!("cannot reset the shard table connection: {e}");
            }
        }
        drop(registry_conn);
        let Err(e) = built else {
            return Ok(shard);
        };
        if !matches!(e, ShardError::SchemaExists(_)) {
            self.drop_namespace(&server, &shard, &name).await;
        }
        self.forget_shard(shard.id);
        if options.schema {
            self.clear_schema_cache();
        }
        Err(e)
    }

    /// Allocate an id, insert the shard row and register it.
    async fn insert_row(
        &self,
        server: &DatabaseServer,
        options: &ProvisionOptions,
        registry_conn: &mut PooledConnection<A>,
    ) -> ShardResult<(Arc<Shard>, String)> {
        let id = match options.id {
            Some(id) => Some(id),
            None if self.adapter().supports_sequences() => Some(
                registry_conn
                    .next_shard_id()
                    .await
                    .map_err(ShardError::from_driver)?,
            ),
            None => None,
        };
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| default_name(server, id));
        let row = registry_conn
            .insert_shard(&NewShard {
                id,
                name: Some(name.clone()),
                database_server_id: Some(server.id.clone()),
            })
            .await
            .map_err(ShardError::from_driver)?;
        Ok((self.registry().register(row), name))
    }

    fn create_statements(
        &self,
        server: &DatabaseServer,
        name: &str,
    ) -> Vec<String> {
        let password = server
            .config(&Environment::DEPLOY)
            .first()
            .password
            .clone();
        self.sharding()
            .create_statements(server.adapter(), name, password.as_deref())
    }

    /// Create the namespace and migrate it on `conn`, the connection holding
    /// the provisioning transaction. `conn` is pointed back at the namespace
    /// it started on afterwards.
    async fn build_in_transaction<M: Migrator<A>>(
        &self,
        conn: &mut PooledConnection<A>,
        server: &DatabaseServer,
        shard: &Arc<Shard>,
        name: &str,
        migrate: bool,
        migrator: &M,
    ) -> ShardResult<()> {
        if conn
            .schema_exists(name)
            .await
            .map_err(ShardError::from_driver)?
        {
            return Err(ShardError::SchemaExists(name.to_string()));
        }
        for statement in &self.create_statements(server, name) {
            debug!("execute '{}' in transaction", statement);
            conn.execute(statement)
                .await
                .map_err(ShardError::from_driver)?;
        }
        if !migrate {
            return Ok(());
        }
        let home = conn
            .schema()
            .map(str::to_string)
            .or_else(|| server.shard_name());
        let origin = conn.shard().clone();
        conn.switch_to(shard, Some(name)).await?;
        let categories = self.sharded_categories();
        let migrated =
            context::activate(shard, &categories, migrator.migrate(conn)).await;
        let restored = match home {
            Some(home) => conn.switch_to(&origin, Some(home.as_str())).await,
            None => Ok(()),
        };
        self.clear_schema_cache();
        migrated?;
        restored
    }

    /// Create the namespace and migrate it, with the new shard active in
    /// every category and connections made in the deploy environment.
    async fn build_shard<M: Migrator<A>>(
        &self,
        server: &DatabaseServer,
        shard: &Arc<Shard>,
        name: &str,
        migrate: bool,
        migrator: &M,
        keep_pool: bool,
    ) -> ShardResult<()> {
        let categories = self.sharded_categories();
        let router = self.router(&Category::PRIMARY);
        let work = async {
            let mut conn = router.connection(false).await?;
            if conn
                .schema_exists(name)
                .await
                .map_err(ShardError::from_driver)?
            {
                return Err(ShardError::SchemaExists(name.to_string()));
            }
            for statement in &self.create_statements(server, name) {
                debug!("execute '{}'", statement);
                conn.execute(statement)
                    .await
                    .map_err(ShardError::from_driver)?;
            }
            drop(conn);
            // a pool made for this shard alone was opened before its
            // namespace existed
            if !keep_pool {
                router.current_pool()?.disconnect();
            }
            if migrate {
                let mut conn = router.connection(true).await?;
                migrator.migrate(&mut conn).await?;
                drop(conn);
                self.clear_schema_cache();
            }
            Ok(())
        };
        context::activate(
            shard,
            &categories,
            context::activate_environment(Environment::DEPLOY, work),
        )
        .await
    }

    /// Every category in use except the unsharded one.
    fn sharded_categories(&self) -> Vec<Category> {
        let mut categories = vec![Category::PRIMARY];
        for router in self.routers() {
            let category = router.category();
            if *category != Category::UNSHARDED
                && !categories.contains(category)
            {
                categories.push(category.clone());
            }
        }
        categories
    }

    async fn drop_namespace(
        &self,
        server: &DatabaseServer,
        shard: &Arc<Shard>,
        name: &str,
    ) {
        let statement = server.adapter().drop_statement(name);
        let router = self.router(&Category::PRIMARY);
        let dropped = context::activate_environment(
            Environment::DEPLOY,
            async {
                let mut conn = router.connection_for(shard, false).await?;
                conn.execute(&statement)
                    .await
                    .map_err(ShardError::from_driver)
            },
        )
        .await;
        if let Err(e) = dropped {
            debug!("cannot drop '{}': {e}", name);
        }
    }

    fn forget_shard(&self, id: ShardId) {
        self.registry().unregister(id);
        for router in self.routers() {
            router.remove_shard(id);
        }
    }

    /// Drop a shard's namespace (best effort), delete its row and forget it.
    pub async fn destroy_shard(&self, id: ShardId) -> ShardResult<()> {
        let shard = self.registry().find(id)?;
        if shard.is_default() {
            return Err(ShardError::InvalidArgument(
                "the default shard cannot be destroyed".into(),
            ));
        }
        let server = self.registry().server_for(&shard)?;
        if let Some(name) = shard.name.clone() {
            self.drop_namespace(&server, &shard, &name).await;
        }
        let mut conn = self.default_connection().await?;
        conn.delete_shard(id).await.map_err(ShardError::from_driver)?;
        self.forget_shard(id);
        info!("destroy shard {}", id);
        Ok(())
    }
}

async fn rollback<A: Adapter>(conn: &mut PooledConnection<A>) {
    if let Err(e) = conn.rollback().await {
        warn!("rollback after failed provisioning: {e}");
    }
}

/// `<database>_shard_<id>`, with a random token standing in for a missing
/// id.
fn default_name(server: &DatabaseServer, id: Option<ShardId>) -> String {
    let suffix = match id {
        Some(id) => id.to_string(),
        None => format!("{:016x}", rand::rng().random::<u64>()),
    };
    match server.raw_config().base.database.as_deref() {
        Some(db) if db != MEMORY_SHARD_NAME => format!("{db}_shard_{suffix}"),
        _ => format!("shard_{suffix}"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::ServerConfig;

    #[test]
    fn test_default_name() {
        let server = DatabaseServer::new("1", ServerConfig::memory("app"));
        assert_eq!(default_name(&server, Some(7)), "app_shard_7");
        let memory = DatabaseServer::new("2", ServerConfig::memory(":memory:"));
        assert_eq!(default_name(&memory, Some(7)), "shard_7");
        let token = default_name(&server, None);
        assert!(token.starts_with("app_shard_"));
        assert_eq!(token.len(), "app_shard_".len() + 16);
    }

    #[test]
    fn test_options() {
        let options = ProvisionOptions::default();
        assert!(options.schema);
        let options = options.with_id(4).with_name("s4").without_schema();
        assert_eq!(options.id, Some(4));
        assert_eq!(options.name.as_deref(), Some("s4"));
        assert!(!options.schema);
    }
}
