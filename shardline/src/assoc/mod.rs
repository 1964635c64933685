//! Associations whose target rows may live on other shards than their
//! owners.

mod preload;

use std::sync::Arc;

pub use preload::preload;

use crate::{
    adapter::Adapter,
    context,
    error::{ShardError, ShardResult},
    id,
    pool::PooledConnection,
    record::{ModelMeta, Record, Value, int_value},
    shard::{Category, Shard, ShardRegistry},
    switchboard::Switchboard,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    BelongsTo,
    HasOne,
    HasMany,
    HasAndBelongsToMany,
}

/// Association metadata. `owner_key` is the column read on the owner,
/// `association_key` the column matched on the target.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub name: String,
    pub kind: AssociationKind,
    pub owner_key: String,
    pub association_key: String,
    pub target_category: Category,
    pub multishard: bool,
}

impl Reflection {
    pub fn belongs_to(
        name: impl Into<String>,
        foreign_key: impl Into<String>,
        target_category: Category,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::BelongsTo,
            owner_key: foreign_key.into(),
            association_key: "id".to_string(),
            target_category,
            multishard: false,
        }
    }

    pub fn has_many(
        name: impl Into<String>,
        foreign_key: impl Into<String>,
        target_category: Category,
    ) -> Self {
        Self {
            name: name.into(),
            kind: AssociationKind::HasMany,
            owner_key: "id".to_string(),
            association_key: foreign_key.into(),
            target_category,
            multishard: false,
        }
    }

    pub fn has_one(
        name: impl Into<String>,
        foreign_key: impl Into<String>,
        target_category: Category,
    ) -> Self {
        Self {
            kind: AssociationKind::HasOne,
            ..Self::has_many(name, foreign_key, target_category)
        }
    }

    /// Matched through a join scope on `join_key`.
    pub fn has_and_belongs_to_many(
        name: impl Into<String>,
        join_key: impl Into<String>,
        target_category: Category,
    ) -> Self {
        Self {
            kind: AssociationKind::HasAndBelongsToMany,
            ..Self::has_many(name, join_key, target_category)
        }
    }

    /// Search every shard the owner declares instead of one shard.
    pub fn multishard(mut self) -> Self {
        self.multishard = true;
        self
    }

    /// The categories activated while querying: the target's and the
    /// owner's.
    pub fn categories(&self, owner: &ModelMeta) -> Vec<Category> {
        let mut out = vec![self.target_category.clone()];
        if owner.category != self.target_category {
            out.push(owner.category.clone());
        }
        out
    }
}

/// A query over the target model that can be restricted to a set of keys
/// and run on a given connection.
#[async_trait::async_trait]
pub trait TargetScope<A: Adapter>: Send + Sync {
    type Record: Record;

    fn model(&self) -> &ModelMeta;

    /// Rows on `shard` whose `column` is one of `keys`.
    async fn find_by_keys(
        &self,
        conn: &mut PooledConnection<A>,
        shard: &Arc<Shard>,
        column: &str,
        keys: &[i64],
    ) -> ShardResult<Vec<Self::Record>>;
}

/// The shard an owner's association lives on. A belongs-to association
/// follows the shard embedded in its foreign key.
pub fn association_shard<O: Record>(
    registry: &ShardRegistry,
    owner: &O,
    reflection: &Reflection,
) -> ShardResult<Arc<Shard>> {
    if reflection.kind == AssociationKind::BelongsTo
        && owner.model().is_sharded(&reflection.owner_key)
    {
        if let Some(fk) = int_value(owner, &reflection.owner_key)? {
            return registry.shard_for(fk, owner.shard());
        }
    }
    Ok(owner.shard().clone())
}

/// The foreign key a new has-one/has-many target built on `shard` gets.
pub fn creation_key<O: Record>(
    owner: &O,
    reflection: &Reflection,
    shard: &Shard,
) -> ShardResult<Option<i64>> {
    if !matches!(
        reflection.kind,
        AssociationKind::HasOne | AssociationKind::HasMany
    ) {
        return Err(ShardError::InvalidArgument(format!(
            "`{}` does not own a foreign key on its targets",
            reflection.name
        )));
    }
    let Some(key) = int_value(owner, &reflection.owner_key)? else {
        return Ok(None);
    };
    if owner.model().is_sharded(&reflection.owner_key) {
        id::relative_id(key, owner.shard(), shard).map(Some)
    } else {
        Ok(Some(key))
    }
}

/// Point a belongs-to association of `owner` at `target`.
pub fn replace_keys<O: Record, T: Record>(
    owner: &mut O,
    reflection: &Reflection,
    target: Option<&T>,
) -> ShardResult<()> {
    if reflection.kind != AssociationKind::BelongsTo {
        return Err(ShardError::InvalidArgument(format!(
            "`{}` is not a belongs-to association",
            reflection.name
        )));
    }
    let value = match target {
        None => Value::Null,
        Some(target) => {
            match int_value(target, &reflection.association_key)? {
                None => Value::Null,
                Some(key)
                    if target.model().is_sharded(&reflection.association_key) =>
                {
                    Value::Int(id::relative_id(key, target.shard(), owner.shard())?)
                }
                Some(key) => Value::Int(key),
            }
        }
    };
    owner.set(&reflection.owner_key, value);
    Ok(())
}

/// Load the association of a single owner, searching each of its shards in
/// turn.
pub async fn load_target<A, O, S>(
    board: &Switchboard<A>,
    owner: &O,
    reflection: &Reflection,
    scope: &S,
) -> ShardResult<Vec<S::Record>>
where
    A: Adapter,
    O: Record,
    S: TargetScope<A>,
{
    let shards = if reflection.multishard {
        owner.associated_shards()
    } else {
        vec![association_shard(board.registry(), owner, reflection)?]
    };
    let Some(raw) = int_value(owner, &reflection.owner_key)? else {
        return Ok(Vec::new());
    };
    let owner_sharded = owner.model().is_sharded(&reflection.owner_key);
    let owner_category = owner.model().category.clone();
    let categories = reflection.categories(owner.model());
    let batches = context::with_each_shard(&shards, &categories, |shard| {
        let owner_category = owner_category.clone();
        async move {
            let key = if owner_sharded {
                id::relative_id(raw, owner.shard(), &board.current(&owner_category))?
            } else {
                raw
            };
            let mut conn =
                board.connection(&reflection.target_category, true).await?;
            scope
                .find_by_keys(&mut conn, &shard, &reflection.association_key, &[key])
                .await
        }
    })
    .await?;
    Ok(batches.into_iter().flatten().collect())
}
