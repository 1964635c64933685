//! Conversions between the local, global and relative forms of a sharded
//! key.
//!
//! A global key is `shard_id * IDS_PER_SHARD + local_id`. Keys owned by the
//! default shard are never transformed.

use crate::{
    error::{ShardError, ShardResult},
    shard::{Shard, ShardId},
};

pub const IDS_PER_SHARD: i64 = 10_000_000_000_000;

/// Encode a local key of `owner` into its system-wide form.
pub fn global_id(local_id: i64, owner: &Shard) -> ShardResult<i64> {
    if local_id < 0 {
        return Err(ShardError::domain(format!(
            "local id {local_id} is negative"
        )));
    }
    if local_id >= IDS_PER_SHARD {
        return Err(ShardError::domain(format!(
            "local id {local_id} is already global"
        )));
    }
    if owner.is_default() {
        return Ok(local_id);
    }
    owner
        .id
        .checked_mul(IDS_PER_SHARD)
        .and_then(|base| base.checked_add(local_id))
        .ok_or_else(|| {
            ShardError::domain(format!(
                "shard {} cannot encode local id {local_id}",
                owner.id
            ))
        })
}

#[inline]
pub fn local_id(value: i64) -> i64 {
    value.rem_euclid(IDS_PER_SHARD)
}

/// The shard id embedded in a global key, or `None` for a local key.
#[inline]
pub fn embedded_shard_id(value: i64) -> Option<ShardId> {
    let abs = value.unsigned_abs();
    if abs < IDS_PER_SHARD as u64 {
        None
    } else {
        Some((abs / IDS_PER_SHARD as u64) as ShardId)
    }
}

#[inline]
pub fn is_global(value: i64) -> bool {
    embedded_shard_id(value).is_some()
}

/// Express `value`, stored on `source`, as code scoped to `target` should see
/// it.
pub fn relative_id(
    value: i64,
    source: &Shard,
    target: &Shard,
) -> ShardResult<i64> {
    if source == target {
        return Ok(local_id(value));
    }
    match embedded_shard_id(value) {
        Some(owner_id) if owner_id == target.id => Ok(local_id(value)),
        // owned by some other shard; re-encoding would lose the owner
        Some(_) => Ok(value),
        None => global_id(value, source),
    }
}
