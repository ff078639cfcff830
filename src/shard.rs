//! # Shard Routing
//!
//! Deterministic mapping of entity ids and natural keys onto physical tables.
//! Hashing is unseeded FNV-1a, so a key lands on the same shard across restarts
//! and machines for a fixed shard count.

use crate::model::EntityId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU32;
use thiserror::Error;

/// Folds the 2ms boundary of the id timestamp into the low bits before hashing.
pub const ID_MIX_SHIFT: u32 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("shard count must be positive, got {0}")]
pub struct ShardCountError(pub u32);

/// Number of physical partitions of a logical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ShardCount(NonZeroU32);

impl ShardCount {
    pub const ONE: ShardCount = ShardCount(NonZeroU32::MIN);

    pub fn new(count: u32) -> Result<Self, ShardCountError> {
        NonZeroU32::new(count)
            .map(ShardCount)
            .ok_or(ShardCountError(count))
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl TryFrom<u32> for ShardCount {
    type Error = ShardCountError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        ShardCount::new(value)
    }
}

impl From<ShardCount> for u32 {
    fn from(value: ShardCount) -> Self {
        value.get()
    }
}

impl fmt::Display for ShardCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

pub fn fnv1a_hash64(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 14695981039346656037;
    const FNV_PRIME: u64 = 1099511628211;
    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn reduce(hash: u64, shards: ShardCount) -> usize {
    ((hash & i64::MAX as u64) % shards.get() as u64) as usize
}

/// Shard index for a generated id.
///
/// Ids minted in the same millisecond share their high bits, so the id is mixed
/// with a shifted copy of itself before hashing its little-endian bytes.
pub fn route_id(id: EntityId, shards: ShardCount) -> usize {
    let mixed = id.0 ^ (id.0 >> ID_MIX_SHIFT);
    reduce(fnv1a_hash64(&mixed.to_le_bytes()), shards)
}

/// Shard index for a natural key, against that key's own shard count.
pub fn route_key(key: &str, shards: ShardCount) -> usize {
    reduce(fnv1a_hash64(key.as_bytes()), shards)
}

/// A logical table split into `shards` physical tables named `logical{index}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedTable {
    logical: String,
    shards: ShardCount,
}

impl ShardedTable {
    pub fn new(logical: impl Into<String>, shards: ShardCount) -> Self {
        Self {
            logical: logical.into(),
            shards,
        }
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn shards(&self) -> ShardCount {
        self.shards
    }

    pub fn table_at(&self, index: usize) -> String {
        format!("{}{}", self.logical, index)
    }

    pub fn table_for_id(&self, id: EntityId) -> String {
        self.table_at(route_id(id, self.shards))
    }

    pub fn table_for_key(&self, key: &str) -> String {
        self.table_at(route_key(key, self.shards))
    }

    /// Every physical table name, in shard order.
    pub fn tables(&self) -> Vec<String> {
        (0..self.shards.get() as usize)
            .map(|index| self.table_at(index))
            .collect()
    }
}
