use std::{
    ops::{Deref, DerefMut},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use mobc::{Manager, Pool};
use tracing::{debug, info};

use crate::{
    adapter::{Adapter, DriverError},
    conf::PoolSettings,
    error::{ShardError, ShardResult},
    pool::SchemaCache,
    server::DbConfig,
    shard::Shard,
};

/// A raw connection plus the bookkeeping the pool needs to reap and verify
/// it.
pub struct TrackedConnection<C> {
    raw: C,
    checked_in: Instant,
    verified: u64,
    schema: Option<String>,
}

pub struct ShardManager<A: Adapter> {
    adapter: Arc<A>,
    config: DbConfig,
}

#[async_trait::async_trait]
impl<A: Adapter> Manager for ShardManager<A> {
    type Connection = TrackedConnection<A::Connection>;

    type Error = A::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let raw = self.adapter.connect(&self.config).await?;
        debug!(
            "open {} connection to {:?}",
            self.adapter.kind(),
            self.config.host
        );
        Ok(TrackedConnection {
            raw,
            checked_in: Instant::now(),
            verified: 0,
            schema: None,
        })
    }

    async fn check(
        &self,
        conn: Self::Connection,
    ) -> Result<Self::Connection, Self::Error> {
        Ok(conn)
    }
}

#[derive(Debug, Default)]
struct Maintenance {
    reap_before: Mutex<Option<Instant>>,
    generation: AtomicU64,
}

impl Maintenance {
    fn is_reaped(&self, checked_in: Instant) -> bool {
        let cutoff = match self.reap_before.lock() {
            Ok(c) => *c,
            Err(poisoned) => *poisoned.into_inner(),
        };
        cutoff.is_some_and(|cutoff| checked_in < cutoff)
    }

    fn reap_before(&self, since: Instant) {
        let mut cutoff = match self.reap_before.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        // never move the cutoff backwards
        if cutoff.is_none_or(|c| c < since) {
            *cutoff = Some(since);
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// One mobc pool for a single connection config, with idle reaping,
/// verification and the query-cache flag layered on top.
pub struct ManagedPool<A: Adapter> {
    adapter: Arc<A>,
    config: DbConfig,
    settings: PoolSettings,
    shared: bool,
    pool: RwLock<Pool<ShardManager<A>>>,
    maintenance: Maintenance,
    query_cache: AtomicBool,
    schema_cache: Arc<SchemaCache>,
}

impl<A: Adapter> std::fmt::Debug for ManagedPool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedPool")
            .field("adapter", &self.adapter.kind())
            .field("host", &self.config.host)
            .field("database", &self.config.database)
            .field("shared", &self.shared)
            .finish()
    }
}

impl<A: Adapter> ManagedPool<A> {
    /// `shared` pools serve several shards and switch schemas on checkout.
    pub fn new(
        adapter: Arc<A>,
        config: DbConfig,
        settings: PoolSettings,
        shared: bool,
        schema_cache: Arc<SchemaCache>,
    ) -> Self {
        let pool = build_pool(adapter.clone(), config.clone(), &settings);
        info!(
            "create {} pool for host {:?} database {:?}",
            adapter.kind(),
            config.host,
            config.database
        );
        Self {
            adapter,
            config,
            settings,
            shared,
            pool: RwLock::new(pool),
            maintenance: Maintenance::default(),
            query_cache: AtomicBool::new(false),
            schema_cache,
        }
    }

    #[inline]
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        &self.schema_cache
    }

    fn inner(&self) -> Pool<ShardManager<A>> {
        match self.pool.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Check out a connection on behalf of `shard`. Connections reaped while
    /// idle are replaced, and connections older than the last verification
    /// are pinged first.
    pub async fn get(
        self: &Arc<Self>,
        shard: &Arc<Shard>,
    ) -> ShardResult<PooledConnection<A>> {
        let mut conn = self.inner().get().await?;
        let generation = self.maintenance.generation();
        if self.maintenance.is_reaped(conn.checked_in) {
            debug!("replace reaped connection to {:?}", self.config.host);
            self.reconnect(&mut conn).await?;
        } else if conn.verified < generation {
            if let Err(e) = self.adapter.ping(&mut conn.raw).await {
                if !e.is_connection_error() {
                    return Err(ShardError::from_driver(e));
                }
                debug!("reconnect to {:?} after failed ping: {e}", self.config.host);
                self.reconnect(&mut conn).await?;
            }
        }
        conn.verified = generation;
        Ok(PooledConnection {
            inner: conn,
            pool: self.clone(),
            shard: shard.clone(),
        })
    }

    async fn reconnect(
        &self,
        conn: &mut TrackedConnection<A::Connection>,
    ) -> ShardResult<()> {
        conn.raw = self
            .adapter
            .connect(&self.config)
            .await
            .map_err(ShardError::from_driver)?;
        conn.schema = None;
        Ok(())
    }

    /// Drop every idle connection. Checked-out connections go back to the
    /// pool they came from and are closed with it.
    pub fn disconnect(&self) {
        let fresh = build_pool(
            self.adapter.clone(),
            self.config.clone(),
            &self.settings,
        );
        match self.pool.write() {
            Ok(mut p) => *p = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        debug!("disconnect pool for {:?}", self.config.host);
    }

    /// Reap idle connections returned before `since`.
    pub fn clear_idle_connections_since(&self, since: Instant) {
        self.maintenance.reap_before(since);
    }

    /// Reap every connection idle right now.
    pub fn flush(&self) {
        self.clear_idle_connections_since(Instant::now());
    }

    /// Ping every idle connection on its next checkout.
    pub fn verify_active_connections(&self) {
        self.maintenance.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn enable_query_cache(&self) {
        self.query_cache.store(true, Ordering::Release);
    }

    pub fn disable_query_cache(&self) {
        self.query_cache.store(false, Ordering::Release);
    }

    pub fn query_cache_enabled(&self) -> bool {
        self.query_cache.load(Ordering::Acquire)
    }
}

fn build_pool<A: Adapter>(
    adapter: Arc<A>,
    config: DbConfig,
    settings: &PoolSettings,
) -> Pool<ShardManager<A>> {
    Pool::builder()
        .max_open(settings.max_open)
        .max_idle(settings.max_idle)
        .get_timeout(settings.get_timeout)
        .build(ShardManager { adapter, config })
}

/// A checked-out connection. Returning it to the pool stamps its checkin
/// time.
pub struct PooledConnection<A: Adapter> {
    inner: mobc::Connection<ShardManager<A>>,
    pool: Arc<ManagedPool<A>>,
    shard: Arc<Shard>,
}

impl<A: Adapter> std::fmt::Debug for PooledConnection<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("host", &self.pool.config.host)
            .field("shard", &self.shard.id)
            .field("schema", &self.inner.schema)
            .finish()
    }
}

impl<A: Adapter> PooledConnection<A> {
    /// The shard this connection was checked out for.
    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    pub fn pool(&self) -> &Arc<ManagedPool<A>> {
        &self.pool
    }

    /// Schema the connection was last switched to.
    pub fn schema(&self) -> Option<&str> {
        self.inner.schema.as_deref()
    }

    pub fn query_cache_enabled(&self) -> bool {
        self.pool.query_cache_enabled()
    }

    pub fn schema_cache(&self) -> &Arc<SchemaCache> {
        self.pool.schema_cache()
    }

    /// Point the connection at `shard`, switching schemas when `name`
    /// differs from the one it is on.
    pub(crate) async fn switch_to(
        &mut self,
        shard: &Arc<Shard>,
        name: Option<&str>,
    ) -> ShardResult<()> {
        if let Some(name) = name {
            if self.inner.schema.as_deref() != Some(name) {
                let adapter = self.pool.adapter.clone();
                adapter
                    .switch_schema(&mut self.inner.raw, name)
                    .await
                    .map_err(ShardError::from_driver)?;
                self.inner.schema = Some(name.to_string());
            }
        }
        self.shard = shard.clone();
        Ok(())
    }

    /// Replace the raw connection with a fresh one, dropping any schema it
    /// was switched to.
    pub(crate) async fn reset(&mut self) -> ShardResult<()> {
        let pool = self.pool.clone();
        pool.reconnect(&mut self.inner).await
    }
}

impl<A: Adapter> Deref for PooledConnection<A> {
    type Target = A::Connection;

    fn deref(&self) -> &Self::Target {
        &self.inner.raw
    }
}

impl<A: Adapter> DerefMut for PooledConnection<A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner.raw
    }
}

impl<A: Adapter> Drop for PooledConnection<A> {
    fn drop(&mut self) {
        self.inner.checked_in = Instant::now();
    }
}
