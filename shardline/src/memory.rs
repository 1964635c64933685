//! An in-process adapter: namespaces of tables held in memory, a shard
//! registry table with a sequence, and knobs to make hosts or statements
//! fail.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::debug;

use crate::{
    adapter::{Adapter, Connection, DriverError},
    assoc::TargetScope,
    error::{ShardError, ShardResult},
    pool::PooledConnection,
    record::{ModelMeta, Row, Value},
    server::{AdapterKind, DbConfig},
    shard::{NewShard, Shard, ShardId},
};

pub type Columns = BTreeMap<String, Value>;

#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    #[error("host {0:?} is unreachable")]
    Unreachable(Option<String>),
    #[error("statement failed: {0}")]
    Statement(String),
    #[error("namespace `{0}` does not exist")]
    NoNamespace(String),
    #[error("shard {0} already exists")]
    DuplicateShard(ShardId),
    #[error("no namespace selected")]
    NoNamespaceSelected,
}

impl DriverError for MemoryError {
    fn is_connection_error(&self) -> bool {
        matches!(self, MemoryError::Unreachable(_))
    }
}

#[derive(Debug, Default, Clone)]
struct Table {
    rows: Vec<Columns>,
    next_id: i64,
}

#[derive(Debug, Default, Clone)]
struct ShardTable {
    rows: BTreeMap<ShardId, Shard>,
    sequence: ShardId,
}

#[derive(Debug, Default)]
struct Store {
    namespaces: Mutex<BTreeMap<String, BTreeMap<String, Table>>>,
    shards: Mutex<ShardTable>,
    failing_hosts: Mutex<HashSet<Option<String>>>,
    failing_statements: Mutex<Vec<String>>,
    statements: Mutex<Vec<String>>,
    connects: AtomicUsize,
    selects: AtomicUsize,
    pings: AtomicUsize,
    shard_deletes: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Store {
    fn check_host(&self, host: &Option<String>) -> Result<(), MemoryError> {
        if lock(&self.failing_hosts).contains(host) {
            Err(MemoryError::Unreachable(host.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemoryAdapter {
    store: Arc<Store>,
    in_clause_length: usize,
    sequences: bool,
    ddl_transactions: bool,
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store::default()),
            in_clause_length: 1000,
            sequences: true,
            ddl_transactions: true,
        }
    }

    pub fn with_in_clause_length(mut self, length: usize) -> Self {
        self.in_clause_length = length;
        self
    }

    pub fn with_sequences(mut self, enabled: bool) -> Self {
        self.sequences = enabled;
        self
    }

    pub fn with_ddl_transactions(mut self, enabled: bool) -> Self {
        self.ddl_transactions = enabled;
        self
    }

    pub fn create_namespace(&self, name: &str) {
        lock(&self.store.namespaces)
            .entry(name.to_string())
            .or_default();
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        lock(&self.store.namespaces).contains_key(name)
    }

    /// Insert a row, assigning the next local `id` when none is given.
    /// Returns the row's id.
    pub fn insert<K, I>(&self, namespace: &str, table: &str, values: I) -> i64
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut namespaces = lock(&self.store.namespaces);
        let table = namespaces
            .entry(namespace.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default();
        let mut row: Columns =
            values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let id = match row.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => table.next_id + 1,
        };
        table.next_id = table.next_id.max(id);
        row.insert("id".to_string(), Value::Int(id));
        table.rows.push(row);
        id
    }

    pub fn has_table(&self, namespace: &str, table: &str) -> bool {
        lock(&self.store.namespaces)
            .get(namespace)
            .is_some_and(|tables| tables.contains_key(table))
    }

    pub fn rows(&self, namespace: &str, table: &str) -> Vec<Columns> {
        lock(&self.store.namespaces)
            .get(namespace)
            .and_then(|tables| tables.get(table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn shard_rows(&self) -> Vec<Shard> {
        lock(&self.store.shards).rows.values().cloned().collect()
    }

    /// Seed the shard table directly.
    pub fn seed_shard(&self, shard: Shard) {
        let mut table = lock(&self.store.shards);
        table.sequence = table.sequence.max(shard.id);
        table.rows.insert(shard.id, shard);
    }

    pub fn fail_host(&self, host: Option<&str>) {
        lock(&self.store.failing_hosts).insert(host.map(str::to_string));
    }

    pub fn restore_host(&self, host: Option<&str>) {
        lock(&self.store.failing_hosts).remove(&host.map(str::to_string));
    }

    /// Make every statement containing `fragment` fail.
    pub fn fail_statement(&self, fragment: &str) {
        lock(&self.store.failing_statements).push(fragment.to_string());
    }

    pub fn connects(&self) -> usize {
        self.store.connects.load(Ordering::SeqCst)
    }

    pub fn selects(&self) -> usize {
        self.store.selects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.store.pings.load(Ordering::SeqCst)
    }

    /// Rows removed from the shard table by `delete_shard`.
    pub fn shard_deletes(&self) -> usize {
        self.store.shard_deletes.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<String> {
        lock(&self.store.statements).clone()
    }

    pub fn reset_counters(&self) {
        self.store.connects.store(0, Ordering::SeqCst);
        self.store.selects.store(0, Ordering::SeqCst);
        self.store.pings.store(0, Ordering::SeqCst);
        self.store.shard_deletes.store(0, Ordering::SeqCst);
        lock(&self.store.statements).clear();
    }
}

#[async_trait::async_trait]
impl Adapter for MemoryAdapter {
    type Connection = MemoryConnection;

    type Error = MemoryError;

    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    async fn connect(
        &self,
        config: &DbConfig,
    ) -> Result<MemoryConnection, MemoryError> {
        self.store.connects.fetch_add(1, Ordering::SeqCst);
        self.store.check_host(&config.host)?;
        Ok(MemoryConnection {
            store: self.store.clone(),
            host: config.host.clone(),
            database: config.database.clone(),
            username: config.username.clone(),
            schema: None,
            snapshot: None,
        })
    }

    async fn ping(&self, conn: &mut MemoryConnection) -> Result<(), MemoryError> {
        self.store.pings.fetch_add(1, Ordering::SeqCst);
        self.store.check_host(&conn.host)
    }

    async fn switch_schema(
        &self,
        conn: &mut MemoryConnection,
        name: &str,
    ) -> Result<(), MemoryError> {
        self.store.check_host(&conn.host)?;
        conn.schema = Some(name.to_string());
        Ok(())
    }

    fn in_clause_length(&self) -> usize {
        self.in_clause_length
    }

    fn supports_ddl_transactions(&self) -> bool {
        self.ddl_transactions
    }

    fn supports_sequences(&self) -> bool {
        self.sequences
    }
}

/// A connection to one host. Transactions cover the shard table only.
#[derive(Debug)]
pub struct MemoryConnection {
    store: Arc<Store>,
    host: Option<String>,
    database: Option<String>,
    username: Option<String>,
    schema: Option<String>,
    snapshot: Option<ShardTable>,
}

impl MemoryConnection {
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// The namespace statements run in: the switched-to schema, else the
    /// configured database.
    pub fn namespace(&self) -> Option<&str> {
        self.schema.as_deref().or(self.database.as_deref())
    }

    /// Rows of `table` whose integer `column` is one of `keys`.
    pub fn select_in(
        &mut self,
        table: &str,
        column: &str,
        keys: &[i64],
    ) -> Result<Vec<Columns>, MemoryError> {
        self.store.check_host(&self.host)?;
        self.store.selects.fetch_add(1, Ordering::SeqCst);
        let namespace = self
            .namespace()
            .ok_or(MemoryError::NoNamespaceSelected)?
            .to_string();
        debug!("select from {namespace}.{table} where {column} in {keys:?}");
        let namespaces = lock(&self.store.namespaces);
        let tables = namespaces
            .get(&namespace)
            .ok_or(MemoryError::NoNamespace(namespace.clone()))?;
        Ok(tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|row| {
                        row.get(column)
                            .and_then(Value::as_i64)
                            .is_some_and(|v| keys.contains(&v))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn run(&mut self, statement: &str) -> Result<u64, MemoryError> {
        let words: Vec<&str> = statement.split_whitespace().collect();
        let upper: Vec<String> =
            words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let upper: Vec<&str> = upper.iter().map(String::as_str).collect();
        let mut namespaces = lock(&self.store.namespaces);
        match upper.as_slice() {
            ["CREATE", "SCHEMA" | "DATABASE", ..] if words.len() >= 3 => {
                let name = words[2];
                if namespaces.contains_key(name) {
                    return Err(MemoryError::Statement(format!(
                        "`{name}` already exists"
                    )));
                }
                namespaces.insert(name.to_string(), BTreeMap::new());
                Ok(1)
            }
            ["DROP", "SCHEMA" | "DATABASE", ..] if words.len() >= 3 => {
                let name = words[2];
                match namespaces.remove(name) {
                    Some(_) => Ok(1),
                    None => Err(MemoryError::NoNamespace(name.to_string())),
                }
            }
            ["CREATE", "TABLE", ..] if words.len() >= 3 => {
                let namespace = self
                    .schema
                    .as_deref()
                    .or(self.database.as_deref())
                    .ok_or(MemoryError::NoNamespaceSelected)?;
                let tables = namespaces
                    .get_mut(namespace)
                    .ok_or_else(|| MemoryError::NoNamespace(namespace.to_string()))?;
                tables.entry(words[2].to_string()).or_default();
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    type Error = MemoryError;

    async fn execute(&mut self, statement: &str) -> Result<u64, MemoryError> {
        self.store.check_host(&self.host)?;
        lock(&self.store.statements).push(statement.to_string());
        let failing = lock(&self.store.failing_statements)
            .iter()
            .any(|f| statement.contains(f.as_str()));
        if failing {
            return Err(MemoryError::Statement(statement.to_string()));
        }
        self.run(statement)
    }

    async fn schema_exists(&mut self, name: &str) -> Result<bool, MemoryError> {
        self.store.check_host(&self.host)?;
        Ok(lock(&self.store.namespaces).contains_key(name))
    }

    async fn next_shard_id(&mut self) -> Result<ShardId, MemoryError> {
        let mut table = lock(&self.store.shards);
        table.sequence += 1;
        Ok(table.sequence)
    }

    async fn insert_shard(&mut self, row: &NewShard) -> Result<Shard, MemoryError> {
        self.store.check_host(&self.host)?;
        let mut table = lock(&self.store.shards);
        let id = match row.id {
            Some(id) => id,
            None => table.sequence + 1,
        };
        if table.rows.contains_key(&id) {
            return Err(MemoryError::DuplicateShard(id));
        }
        table.sequence = table.sequence.max(id);
        let shard =
            Shard::new(id, row.name.clone(), row.database_server_id.clone());
        table.rows.insert(id, shard.clone());
        Ok(shard)
    }

    async fn delete_shard(&mut self, id: ShardId) -> Result<(), MemoryError> {
        self.store.check_host(&self.host)?;
        if lock(&self.store.shards).rows.remove(&id).is_some() {
            self.store.shard_deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn list_shards(&mut self) -> Result<Vec<Shard>, MemoryError> {
        self.store.check_host(&self.host)?;
        Ok(lock(&self.store.shards).rows.values().cloned().collect())
    }

    async fn begin(&mut self) -> Result<(), MemoryError> {
        self.snapshot = Some(lock(&self.store.shards).clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), MemoryError> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), MemoryError> {
        if let Some(snapshot) = self.snapshot.take() {
            let mut table = lock(&self.store.shards);
            // the sequence is not transactional
            let sequence = table.sequence;
            *table = snapshot;
            table.sequence = sequence;
        }
        Ok(())
    }
}

/// Loads rows of one in-memory table as [`Row`] records.
#[derive(Debug, Clone)]
pub struct MemoryTableScope {
    table: String,
    model: Arc<ModelMeta>,
}

impl MemoryTableScope {
    pub fn new(table: impl Into<String>, model: Arc<ModelMeta>) -> Self {
        Self {
            table: table.into(),
            model,
        }
    }
}

#[async_trait::async_trait]
impl TargetScope<MemoryAdapter> for MemoryTableScope {
    type Record = Row;

    fn model(&self) -> &ModelMeta {
        &self.model
    }

    async fn find_by_keys(
        &self,
        conn: &mut PooledConnection<MemoryAdapter>,
        shard: &Arc<Shard>,
        column: &str,
        keys: &[i64],
    ) -> ShardResult<Vec<Row>> {
        let rows = conn
            .select_in(&self.table, column, keys)
            .map_err(ShardError::from_driver)?;
        Ok(rows
            .into_iter()
            .map(|values| Row::new(shard.clone(), self.model.clone(), values))
            .collect())
    }
}
