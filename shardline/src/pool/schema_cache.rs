use std::{future::Future, sync::Arc};

use tracing::debug;

/// Column lists keyed by table name, shared by every pool of a switchboard so
/// introspection happens once per process rather than once per shard.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: scc::HashMap<String, Arc<Vec<String>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str) -> Option<Arc<Vec<String>>> {
        self.tables.read(table, |_, cols| cols.clone())
    }

    pub fn insert(&self, table: impl Into<String>, columns: Vec<String>) {
        self.tables.upsert(table.into(), Arc::new(columns));
    }

    /// The cached columns of `table`, running `load` on a miss.
    pub async fn get_or_load<E, F, Fut>(
        &self,
        table: &str,
        load: F,
    ) -> Result<Arc<Vec<String>>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>, E>>,
    {
        if let Some(found) = self.get(table) {
            return Ok(found);
        }
        debug!("load columns of '{}'", table);
        let columns = Arc::new(load().await?);
        let entry = self
            .tables
            .entry_async(table.to_string())
            .await
            .or_insert(columns);
        Ok(entry.get().clone())
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn clear(&self) {
        self.tables.clear();
    }
}
