use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tracing::debug;

use crate::{
    adapter::Adapter,
    assoc::{AssociationKind, Reflection, TargetScope},
    context,
    error::{ShardError, ShardResult},
    id,
    record::{Record, global_form, int_value},
    shard::Shard,
    switchboard::Switchboard,
};

/// Load `reflection` for every owner with one batch of queries per shard.
/// The result holds each owner's targets, in owner order.
///
/// Owners are keyed by the global form of their join key, so a target
/// found on any shard is attached to every owner that asked for its key.
pub async fn preload<A, O, S>(
    board: &Switchboard<A>,
    owners: &[O],
    reflection: &Reflection,
    scope: &S,
) -> ShardResult<Vec<Vec<S::Record>>>
where
    A: Adapter,
    O: Record,
    S: TargetScope<A>,
    S::Record: Clone,
{
    let mut results: Vec<Vec<S::Record>> =
        (0..owners.len()).map(|_| Vec::new()).collect();
    let owners_by_key = owners_by_key(owners, &reflection.owner_key)?;
    if owners_by_key.is_empty() {
        return Ok(results);
    }

    // which shard(s) each owner with a key is searched on
    let mut assignments: Vec<(Arc<Shard>, usize)> = Vec::new();
    for (index, owner) in owners.iter().enumerate() {
        let Some(raw) = int_value(owner, &reflection.owner_key)? else {
            continue;
        };
        match reflection.kind {
            AssociationKind::BelongsTo => {
                let shard = if owner.model().is_sharded(&reflection.owner_key)
                {
                    board.registry().shard_for(raw, owner.shard())?
                } else {
                    board.current(&owner.model().category)
                };
                assignments.push((shard, index));
            }
            _ if reflection.multishard => {
                for shard in owner.associated_shards() {
                    assignments.push((shard, index));
                }
            }
            _ => assignments.push((owner.shard().clone(), index)),
        }
    }

    let owner_category = owners[0].model().category.clone();
    let categories = reflection.categories(owners[0].model());
    let in_clause_length = board.in_clause_length();
    let batches = context::partition_by_shard_with(
        assignments,
        &categories,
        |(shard, _)| Ok::<_, ShardError>(shard.clone()),
        |shard, subset| {
            let owner_category = owner_category.clone();
            async move {
                let current = board.current(&owner_category);
                let mut keys: Vec<i64> = Vec::with_capacity(subset.len());
                let mut seen = HashSet::with_capacity(subset.len());
                for (_, index) in subset {
                    let owner = &owners[index];
                    let Some(raw) = int_value(owner, &reflection.owner_key)?
                    else {
                        continue;
                    };
                    let key = if owner.model().is_sharded(&reflection.owner_key)
                    {
                        id::relative_id(raw, owner.shard(), &current)?
                    } else {
                        raw
                    };
                    if seen.insert(key) {
                        keys.push(key);
                    }
                }
                let mut records = Vec::new();
                if keys.is_empty() {
                    return Ok(records);
                }
                let mut conn =
                    board.connection(&reflection.target_category, true).await?;
                for slice in keys.chunks(in_clause_length) {
                    debug!(
                        "preload '{}' on shard {} for {} keys",
                        reflection.name,
                        shard.id,
                        slice.len()
                    );
                    records.extend(
                        scope
                            .find_by_keys(
                                &mut conn,
                                &shard,
                                &reflection.association_key,
                                slice,
                            )
                            .await?,
                    );
                }
                Ok::<_, ShardError>(records)
            }
        },
    )
    .await?;

    let target_sharded = scope.model().is_sharded(&reflection.association_key);
    for record in batches.into_iter().flatten() {
        let Some(raw) = int_value(&record, &reflection.association_key)? else {
            continue;
        };
        let key = if target_sharded {
            global_form(raw, record.shard())?
        } else {
            raw
        };
        if let Some(indexes) = owners_by_key.get(&key) {
            for &index in indexes {
                results[index].push(record.clone());
            }
        }
    }
    Ok(results)
}

/// Owner positions keyed by the global form of their join key. Owners
/// without a key are left out.
fn owners_by_key<O: Record>(
    owners: &[O],
    column: &str,
) -> ShardResult<HashMap<i64, Vec<usize>>> {
    let mut out: HashMap<i64, Vec<usize>> = HashMap::new();
    for (index, owner) in owners.iter().enumerate() {
        let Some(raw) = int_value(owner, column)? else {
            continue;
        };
        let key = if owner.model().is_sharded(column) {
            global_form(raw, owner.shard())?
        } else {
            raw
        };
        out.entry(key).or_default().push(index);
    }
    Ok(out)
}
