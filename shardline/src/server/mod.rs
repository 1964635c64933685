mod config;
mod provision;

use std::sync::{Mutex, RwLock};

pub use config::*;
pub use provision::{
    Migrator, NoopMigrator, ProvisionOptions, StatementMigrator,
};

use crate::context;

type ShareableKey = (Environment, Option<String>);

/// A physical connection target hosting one or more shards.
pub struct DatabaseServer {
    pub id: String,
    config: ServerConfig,
    resolved: scc::HashMap<Environment, ResolvedConfig>,
    guard: RwLock<Option<Environment>>,
    shareable: Mutex<Option<(ShareableKey, bool)>>,
}

impl std::fmt::Debug for DatabaseServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseServer")
            .field("id", &self.id)
            .field("adapter", &self.config.base.adapter)
            .finish()
    }
}

impl DatabaseServer {
    pub fn new(id: impl Into<String>, config: ServerConfig) -> Self {
        Self {
            id: id.into(),
            config,
            resolved: scc::HashMap::new(),
            guard: RwLock::new(None),
            shareable: Mutex::new(None),
        }
    }

    #[inline]
    pub fn raw_config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    pub fn adapter(&self) -> AdapterKind {
        self.config.base.adapter
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.config.base.open
    }

    /// The effective connection parameters for `environment`.
    pub fn config(&self, environment: &Environment) -> ResolvedConfig {
        if let Some(found) = self.resolved.read(environment, |_, c| c.clone()) {
            return found;
        }
        let resolved = self.config.resolve(environment);
        let _ = self.resolved.insert(environment.clone(), resolved.clone());
        resolved
    }

    /// Lock this server to `environment` regardless of the task's
    /// environment.
    pub fn guard(&self, environment: Environment) {
        match self.guard.write() {
            Ok(mut g) => *g = Some(environment),
            Err(poisoned) => *poisoned.into_inner() = Some(environment),
        }
    }

    pub fn unguard(&self) {
        match self.guard.write() {
            Ok(mut g) => *g = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    pub fn guarded(&self) -> Option<Environment> {
        match self.guard.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// The environment connections to this server are made in.
    pub fn environment(&self) -> Environment {
        self.guarded().unwrap_or_else(context::current_environment)
    }

    /// Whether one pool can serve every shard of this server: true when the
    /// effective username has no per-shard placeholder. `explicit_username`
    /// overrides the configured one.
    pub fn shareable(&self, explicit_username: Option<&str>) -> bool {
        let key: ShareableKey =
            (self.environment(), explicit_username.map(str::to_string));
        let mut cached = match self.shareable.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((cached_key, value)) = cached.as_ref() {
            if *cached_key == key {
                return *value;
            }
        }
        let username = match explicit_username {
            Some(user) => Some(user.to_string()),
            None => self.config(&key.0).first().username.clone(),
        };
        let value = !username.as_deref().is_some_and(has_placeholder);
        *cached = Some((key, value));
        value
    }

    /// The key shareable pools of this server are stored under; `None` for
    /// the default server.
    pub fn pool_key(&self, default_server_id: &str) -> Option<String> {
        if self.id == default_server_id {
            None
        } else {
            Some(self.id.clone())
        }
    }

    /// The namespace name of the server's primary shard when the config
    /// names one.
    pub fn shard_name(&self) -> Option<String> {
        let base = &self.config.base;
        base.shard_name.clone().or_else(|| {
            if base.adapter.uses_schemas() {
                None
            } else {
                base.database.clone()
            }
        })
    }
}
