use std::{
    borrow::Cow,
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, RwLock},
};

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    context,
    error::{ShardError, ShardResult},
    id,
    server::DatabaseServer,
};

pub type ShardId = i64;

/// Name used by sqlite-style servers for a throwaway database; such shards are
/// never picked as the template shard of a server.
pub const MEMORY_SHARD_NAME: &str = ":memory:";

/// An independent sharding dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Category(Cow<'static, str>);

impl Category {
    pub const PRIMARY: Category = Category(Cow::Borrowed("primary"));
    pub const UNSHARDED: Category = Category(Cow::Borrowed("unsharded"));

    pub fn new(name: impl Into<String>) -> Self {
        Category(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of the shard registry table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub name: Option<String>,
    pub database_server_id: Option<String>,
    #[serde(skip)]
    default: bool,
}

impl Shard {
    pub fn new(
        id: ShardId,
        name: Option<String>,
        database_server_id: Option<String>,
    ) -> Self {
        Self {
            id,
            name,
            database_server_id,
            default: false,
        }
    }

    pub fn default_shard(
        id: ShardId,
        database_server_id: Option<String>,
    ) -> Self {
        Self {
            id,
            name: None,
            database_server_id,
            default: true,
        }
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        self.default
    }

    pub fn global_id_for(&self, local_id: i64) -> ShardResult<i64> {
        id::global_id(local_id, self)
    }
}

impl PartialEq for Shard {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Shard {}

impl Hash for Shard {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A shard row that has not been persisted yet. `id` is left empty when the
/// registry table allocates it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewShard {
    pub id: Option<ShardId>,
    pub name: Option<String>,
    pub database_server_id: Option<String>,
}

/// Every known shard and database server of the process.
pub struct ShardRegistry {
    default_shard: RwLock<Arc<Shard>>,
    default_server_id: String,
    default_server: Arc<DatabaseServer>,
    shards: scc::HashMap<ShardId, Arc<Shard>>,
    servers: scc::HashMap<String, Arc<DatabaseServer>>,
}

impl ShardRegistry {
    /// Start with a synthetic default shard (id 0) on the default server.
    pub fn new(default_server: DatabaseServer) -> Self {
        let default_server_id = default_server.id.clone();
        let default_server = Arc::new(default_server);
        let servers = scc::HashMap::new();
        let _ = servers.insert(default_server_id.clone(), default_server.clone());
        Self {
            default_shard: RwLock::new(Arc::new(Shard::default_shard(
                0,
                Some(default_server_id.clone()),
            ))),
            default_server_id,
            default_server,
            shards: scc::HashMap::new(),
            servers,
        }
    }

    pub fn default_shard(&self) -> Arc<Shard> {
        match self.default_shard.read() {
            Ok(shard) => shard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    #[inline]
    pub fn default_server_id(&self) -> &str {
        &self.default_server_id
    }

    pub fn default_server(&self) -> Arc<DatabaseServer> {
        self.default_server.clone()
    }

    pub fn add_server(&self, server: DatabaseServer) -> Arc<DatabaseServer> {
        if server.id == self.default_server_id {
            warn!("cannot replace the default server '{}'", server.id);
            return self.default_server();
        }
        let server = Arc::new(server);
        debug!("register database server '{}'", server.id);
        self.servers.upsert(server.id.clone(), server.clone());
        server
    }

    pub fn remove_server(&self, id: &str) -> Option<Arc<DatabaseServer>> {
        if id == self.default_server_id {
            return None;
        }
        self.servers.remove(id).map(|(_, s)| s)
    }

    pub fn server(&self, id: &str) -> ShardResult<Arc<DatabaseServer>> {
        self.servers
            .read(id, |_, s| s.clone())
            .ok_or_else(|| ShardError::NonExistentServer(id.to_string()))
    }

    pub fn servers(&self) -> Vec<Arc<DatabaseServer>> {
        let mut out = Vec::with_capacity(self.servers.len());
        self.servers.scan(|_, s| out.push(s.clone()));
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// The server backing `shard`; shards without a server live on the
    /// default server.
    pub fn server_for(&self, shard: &Shard) -> ShardResult<Arc<DatabaseServer>> {
        match &shard.database_server_id {
            Some(id) => self.server(id),
            None => Ok(self.default_server()),
        }
    }

    pub fn is_on_default_server(&self, shard: &Shard) -> bool {
        shard
            .database_server_id
            .as_deref()
            .is_none_or(|id| id == self.default_server_id)
    }

    /// Pick a server for a new shard: any server marked open, else the
    /// default server.
    pub fn server_for_new_shard(&self) -> Arc<DatabaseServer> {
        let open: Vec<_> = self
            .servers()
            .into_iter()
            .filter(|s| s.is_open())
            .collect();
        open.choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| self.default_server())
    }

    pub fn register(&self, shard: Shard) -> Arc<Shard> {
        let shard = Arc::new(shard);
        if shard.is_default() {
            self.set_default(shard.clone());
        }
        self.shards.upsert(shard.id, shard.clone());
        shard
    }

    fn set_default(&self, shard: Arc<Shard>) {
        info!("use shard {} as the default shard", shard.id);
        match self.default_shard.write() {
            Ok(mut current) => *current = shard,
            Err(poisoned) => *poisoned.into_inner() = shard,
        }
    }

    /// Register the rows of the shard table. The unnamed row on the default
    /// server becomes the default shard.
    pub fn load(&self, rows: Vec<Shard>) {
        for row in rows {
            let promote = row.name.is_none() && self.is_on_default_server(&row);
            let shard = if promote {
                Shard::default_shard(row.id, row.database_server_id)
            } else {
                Shard::new(row.id, row.name, row.database_server_id)
            };
            self.register(shard);
        }
    }

    pub fn unregister(&self, id: ShardId) -> Option<Arc<Shard>> {
        self.shards.remove(&id).map(|(_, s)| s)
    }

    pub fn lookup(&self, id: ShardId) -> Option<Arc<Shard>> {
        let default = self.default_shard();
        if default.id == id {
            return Some(default);
        }
        self.shards.read(&id, |_, s| s.clone())
    }

    pub fn find(&self, id: ShardId) -> ShardResult<Arc<Shard>> {
        self.lookup(id).ok_or(ShardError::NonExistentShard(id))
    }

    /// Whether `shard` is known to the registry.
    pub fn contains(&self, shard: &Shard) -> bool {
        self.lookup(shard.id).is_some()
    }

    /// All registered shards ordered by id.
    pub fn shards(&self) -> Vec<Arc<Shard>> {
        let mut out = Vec::with_capacity(self.shards.len());
        self.shards.scan(|_, s| out.push(s.clone()));
        out.sort_by_key(|s| s.id);
        out
    }

    /// Shards hosted by `server_id`, ordered by id.
    pub fn shards_on(&self, server_id: &str) -> Vec<Arc<Shard>> {
        let on_default = server_id == self.default_server_id;
        self.shards()
            .into_iter()
            .filter(|s| match &s.database_server_id {
                Some(id) => id == server_id,
                None => on_default,
            })
            .collect()
    }

    /// The shard active for `category` in the current task, falling back to
    /// the default shard.
    pub fn current(&self, category: &Category) -> Arc<Shard> {
        context::current(category).unwrap_or_else(|| self.default_shard())
    }

    /// Resolve the shard owning `value`; local values belong to `fallback`.
    pub fn shard_for(
        &self,
        value: i64,
        fallback: &Arc<Shard>,
    ) -> ShardResult<Arc<Shard>> {
        match id::embedded_shard_id(value) {
            None => Ok(fallback.clone()),
            Some(shard_id) => self.find(shard_id),
        }
    }
}
