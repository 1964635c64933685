use std::{
    borrow::Cow,
    collections::BTreeMap,
    fmt,
    path::Path,
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ShardError, ShardResult};

/// `%{shard_name}`, with the `%` optional.
static SHARD_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%?\{shard_name\}").unwrap());

/// A read/write role a server can be connected in.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Environment(Cow<'static, str>);

impl Environment {
    pub const PRIMARY: Environment = Environment(Cow::Borrowed("primary"));
    pub const SECONDARY: Environment = Environment(Cow::Borrowed("secondary"));
    pub const DEPLOY: Environment = Environment(Cow::Borrowed("deploy"));

    pub fn new(name: impl Into<String>) -> Self {
        Environment(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Environment {
    fn default() -> Self {
        Environment::PRIMARY
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Postgresql,
    Mysql,
    Sqlite,
    Memory,
}

impl AdapterKind {
    /// Statements creating the namespace of a new shard. `%{name}` and
    /// `%{password}` are substituted.
    pub fn create_statement(&self) -> Vec<String> {
        match self {
            AdapterKind::Postgresql => vec!["CREATE SCHEMA %{name}".into()],
            AdapterKind::Mysql | AdapterKind::Sqlite | AdapterKind::Memory => {
                vec!["CREATE DATABASE %{name}".into()]
            }
        }
    }

    pub fn drop_statement(&self, name: &str) -> String {
        match self {
            AdapterKind::Postgresql => format!("DROP SCHEMA {name} CASCADE"),
            AdapterKind::Mysql | AdapterKind::Sqlite | AdapterKind::Memory => {
                format!("DROP DATABASE {name}")
            }
        }
    }

    /// Whether shards on this adapter live in schemas of one database
    /// rather than in databases of their own.
    pub fn uses_schemas(&self) -> bool {
        matches!(self, AdapterKind::Postgresql)
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterKind::Postgresql => "postgresql",
            AdapterKind::Mysql => "mysql",
            AdapterKind::Sqlite => "sqlite",
            AdapterKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// Connection parameters for one physical target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    pub adapter: AdapterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Explicit schema name of the server's primary shard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    /// Whether new shards may be placed on this server.
    #[serde(default)]
    pub open: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl DbConfig {
    pub fn new(adapter: AdapterKind) -> Self {
        Self {
            adapter,
            host: None,
            port: None,
            database: None,
            username: None,
            password: None,
            shard_name: None,
            connect_timeout_ms: None,
            open: false,
            options: BTreeMap::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_open(mut self, open: bool) -> Self {
        self.open = open;
        self
    }

    fn merge(&self, patch: &ConfigPatch) -> DbConfig {
        let mut out = self.clone();
        if let Some(adapter) = patch.adapter {
            out.adapter = adapter;
        }
        merge_opt(&mut out.host, &patch.host);
        merge_opt(&mut out.port, &patch.port);
        merge_opt(&mut out.database, &patch.database);
        merge_opt(&mut out.username, &patch.username);
        merge_opt(&mut out.password, &patch.password);
        merge_opt(&mut out.shard_name, &patch.shard_name);
        merge_opt(&mut out.connect_timeout_ms, &patch.connect_timeout_ms);
        if let Some(open) = patch.open {
            out.open = open;
        }
        out.options
            .extend(patch.options.iter().map(|(k, v)| (k.clone(), v.clone())));
        out
    }

    /// Substitute the per-shard placeholder with `shard_name`.
    pub fn for_shard(&self, shard_name: &str) -> DbConfig {
        let mut out = self.clone();
        for field in [&mut out.database, &mut out.username, &mut out.password] {
            if let Some(value) = field.as_mut() {
                *value = SHARD_NAME_PATTERN
                    .replace_all(value, regex::NoExpand(shard_name))
                    .into_owned();
            }
        }
        out
    }
}

fn merge_opt<T: Clone>(target: &mut Option<T>, patch: &Option<T>) {
    if let Some(v) = patch {
        *target = Some(v.clone());
    }
}

/// Per-environment override of a server's base parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter: Option<AdapterKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl ConfigPatch {
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Ordered failover candidates.
    Candidates(Vec<ConfigPatch>),
    Single(ConfigPatch),
}

/// Raw configuration of one database server, as written in the servers file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub base: DbConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<Environment, EnvironmentConfig>,
}

impl ServerConfig {
    pub fn new(base: DbConfig) -> Self {
        Self {
            base,
            environments: BTreeMap::new(),
        }
    }

    pub fn memory(database: impl Into<String>) -> Self {
        Self::new(DbConfig::new(AdapterKind::Memory).with_database(database))
    }

    pub fn with_environment(
        mut self,
        environment: Environment,
        config: EnvironmentConfig,
    ) -> Self {
        self.environments.insert(environment, config);
        self
    }

    /// Merge the base parameters with the override for `environment`. Each
    /// failover candidate inherits the base on its own; the environment map
    /// never reaches a resolved config.
    pub fn resolve(&self, environment: &Environment) -> ResolvedConfig {
        match self.environments.get(environment) {
            Some(EnvironmentConfig::Candidates(list)) if !list.is_empty() => {
                ResolvedConfig::Candidates(
                    list.iter().map(|p| self.base.merge(p)).collect(),
                )
            }
            Some(EnvironmentConfig::Single(patch)) => {
                ResolvedConfig::Single(self.base.merge(patch))
            }
            _ => ResolvedConfig::Single(self.base.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedConfig {
    Single(DbConfig),
    Candidates(Vec<DbConfig>),
}

impl ResolvedConfig {
    /// The config a fresh pool is built from.
    pub fn first(&self) -> &DbConfig {
        match self {
            ResolvedConfig::Single(c) => c,
            ResolvedConfig::Candidates(list) => &list[0],
        }
    }

    pub fn candidates(&self) -> Option<&[DbConfig]> {
        match self {
            ResolvedConfig::Single(_) => None,
            ResolvedConfig::Candidates(list) => Some(list),
        }
    }
}

/// True when `value` holds the per-shard placeholder [`DbConfig::for_shard`]
/// substitutes.
pub fn has_placeholder(value: &str) -> bool {
    SHARD_NAME_PATTERN.is_match(value)
}

/// Sharding options shared by every server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardingConfig {
    #[serde(default)]
    pub create_statement: Option<Vec<String>>,
    #[serde(default)]
    pub adapters: BTreeMap<AdapterKind, AdapterOptions>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterOptions {
    #[serde(default)]
    pub create_statement: Option<Vec<String>>,
}

impl ShardingConfig {
    /// The create statements for a shard named `name` on `adapter`: the
    /// adapter override, then the global override, then the built-in one.
    pub fn create_statements(
        &self,
        adapter: AdapterKind,
        name: &str,
        password: Option<&str>,
    ) -> Vec<String> {
        let templates = self
            .adapters
            .get(&adapter)
            .and_then(|o| o.create_statement.clone())
            .or_else(|| self.create_statement.clone())
            .unwrap_or_else(|| adapter.create_statement());
        templates
            .iter()
            .map(|t| {
                t.replace("%{name}", name)
                    .replace("%{password}", password.unwrap_or(""))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub sharding: ShardingConfig,
    pub servers: BTreeMap<String, ServerConfig>,
}

impl ServersFile {
    pub fn parse(content: &str) -> ShardResult<Self> {
        serde_yaml::from_str(content).map_err(ShardError::config)
    }

    pub fn load(path: impl AsRef<Path>) -> ShardResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShardError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }
}
