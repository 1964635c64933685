//! The record abstraction the association resolver and the key-translating
//! attribute layer work on.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    context::ShardOwned,
    error::{ShardError, ShardResult},
    id::{self, IDS_PER_SHARD},
    shard::{Category, Shard, ShardRegistry},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Bool(bool),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<Option<i64>> for Value {
    fn from(value: Option<i64>) -> Self {
        value.map(Value::Int).unwrap_or(Value::Null)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// Which columns of a model hold sharded keys, and in which category the
/// rows they point at live.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub name: String,
    pub primary_key: String,
    pub category: Category,
    sharded: BTreeMap<String, Category>,
}

impl ModelMeta {
    /// A model in `category` whose integer primary key `id` is sharded
    /// unless the category is unsharded.
    pub fn new(name: impl Into<String>, category: Category) -> Self {
        let mut sharded = BTreeMap::new();
        if category != Category::UNSHARDED {
            sharded.insert("id".to_string(), category.clone());
        }
        Self {
            name: name.into(),
            primary_key: "id".to_string(),
            category,
            sharded,
        }
    }

    /// Mark `column` as a foreign key to a model of `category`.
    pub fn with_foreign_key(
        mut self,
        column: impl Into<String>,
        category: Category,
    ) -> Self {
        if category != Category::UNSHARDED {
            self.sharded.insert(column.into(), category);
        }
        self
    }

    pub fn is_sharded(&self, column: &str) -> bool {
        self.sharded.contains_key(column)
    }

    /// The category whose current shard a sharded column is presented
    /// relative to.
    pub fn category_for(&self, column: &str) -> Option<&Category> {
        self.sharded.get(column)
    }
}

pub trait Record: Send + Sync {
    /// The shard the record was loaded from, or will be saved to.
    fn shard(&self) -> &Arc<Shard>;

    fn model(&self) -> &ModelMeta;

    /// The raw stored value of `column`.
    fn get(&self, column: &str) -> Option<&Value>;

    fn set(&mut self, column: &str, value: Value);

    /// Shards a multishard association of this record searches.
    fn associated_shards(&self) -> Vec<Arc<Shard>> {
        vec![self.shard().clone()]
    }
}

/// A plain column map bound to a shard.
#[derive(Debug, Clone)]
pub struct Row {
    shard: Arc<Shard>,
    model: Arc<ModelMeta>,
    values: BTreeMap<String, Value>,
    associated: Vec<Arc<Shard>>,
}

impl Row {
    pub fn new(
        shard: Arc<Shard>,
        model: Arc<ModelMeta>,
        values: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            shard,
            model,
            values,
            associated: Vec::new(),
        }
    }

    pub fn with_associated_shards(mut self, shards: Vec<Arc<Shard>>) -> Self {
        self.associated = shards;
        self
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

impl Record for Row {
    fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    fn model(&self) -> &ModelMeta {
        &self.model
    }

    fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    fn set(&mut self, column: &str, value: Value) {
        self.values.insert(column.to_string(), value);
    }

    fn associated_shards(&self) -> Vec<Arc<Shard>> {
        if self.associated.is_empty() {
            vec![self.shard.clone()]
        } else {
            self.associated.clone()
        }
    }
}

impl ShardOwned for Row {
    fn owning_shard(&self) -> &Arc<Shard> {
        &self.shard
    }
}

/// Key-translating reads and writes of sharded columns. Relative values are
/// computed against the current shard of the column's category.
pub trait ShardedAttributes: Record {
    /// `column` as code scoped to the current shard should see it.
    fn relative(
        &self,
        registry: &ShardRegistry,
        column: &str,
    ) -> ShardResult<Option<i64>> {
        let category = sharded_category(self.model(), column)?;
        let Some(raw) = int_value(self, column)? else {
            return Ok(None);
        };
        let current = registry.current(category);
        present(raw, self.shard(), &current).map(Some)
    }

    /// `column` in its system-wide form.
    fn global(&self, column: &str) -> ShardResult<Option<i64>> {
        sharded_category(self.model(), column)?;
        match int_value(self, column)? {
            None => Ok(None),
            Some(raw) => global_form(raw, self.shard()).map(Some),
        }
    }

    /// `column` with any embedded shard stripped.
    fn local(&self, column: &str) -> ShardResult<Option<i64>> {
        sharded_category(self.model(), column)?;
        Ok(int_value(self, column)?.map(id::local_id))
    }

    /// Store `value`, given relative to the current shard, in the form this
    /// record's shard expects.
    fn assign_relative(
        &mut self,
        registry: &ShardRegistry,
        column: &str,
        value: Option<i64>,
    ) -> ShardResult<()> {
        let category = sharded_category(self.model(), column)?.clone();
        let stored = match value {
            None => Value::Null,
            Some(v) => {
                let current = registry.current(&category);
                Value::Int(id::relative_id(v, &current, self.shard())?)
            }
        };
        self.set(column, stored);
        Ok(())
    }
}

impl<R: Record + ?Sized> ShardedAttributes for R {}

fn sharded_category<'a>(
    model: &'a ModelMeta,
    column: &str,
) -> ShardResult<&'a Category> {
    model.category_for(column).ok_or_else(|| {
        ShardError::InvalidArgument(format!(
            "column `{column}` of `{}` is not a sharded key",
            model.name
        ))
    })
}

/// The integer stored in `column`; `None` when absent or null.
pub(crate) fn int_value<R: Record + ?Sized>(
    record: &R,
    column: &str,
) -> ShardResult<Option<i64>> {
    match record.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Int(v)) => Ok(Some(*v)),
        Some(other) => Err(ShardError::InvalidArgument(format!(
            "column `{column}` holds {other}, not an integer key"
        ))),
    }
}

/// The global form of a stored key: unchanged when already global or when
/// `owner` is the default shard.
pub fn global_form(raw: i64, owner: &Shard) -> ShardResult<i64> {
    if id::is_global(raw) {
        Ok(raw)
    } else {
        id::global_id(raw, owner)
    }
}

/// A key stored on `owner`, as seen from `current`. Keys that point at a
/// third shard keep their global form.
pub fn present(raw: i64, owner: &Shard, current: &Shard) -> ShardResult<i64> {
    let same_shard = owner == current;
    let is_local = raw.unsigned_abs() < IDS_PER_SHARD as u64;
    if same_shard && is_local {
        return Ok(raw);
    }
    match id::embedded_shard_id(raw) {
        Some(shard_id) if shard_id == current.id => Ok(id::local_id(raw)),
        Some(_) => Ok(raw),
        None => id::global_id(raw, owner),
    }
}
