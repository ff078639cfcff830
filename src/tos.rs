//! # Time-Ordered Set Accelerator
//!
//! Bounded named sets of `(time, value)` items ordered by time then value.
//! Members are stored as `"{time:020}_{value}"` strings so that plain string
//! order is the item order; values must therefore be fixed width (entity ids
//! are rendered with [`EntityId::to_fixed_width`](crate::model::EntityId::to_fixed_width)).
//!
//! The accelerator is a cache: callers treat every error as a miss.

use crate::config::MAX_ACCELERATOR_FETCH;
use crate::model::Millis;
use async_trait::async_trait;
use dashmap::DashMap;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TosItem {
    pub time: Millis,
    pub value: String,
}

impl TosItem {
    pub fn new(time: Millis, value: impl Into<String>) -> Self {
        Self {
            time,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcceleratorError {
    #[error("invalid set name {0:?}")]
    InvalidName(String),
    #[error("max size must be positive")]
    InvalidMaxSize,
    #[error("fetch limit {0} exceeds {max}", max = MAX_ACCELERATOR_FETCH)]
    InvalidLimit(usize),
    #[error("negative order time {0}")]
    NegativeTime(Millis),
    #[error("malformed member {member:?} in set {set}")]
    Corrupt { set: String, member: String },
    #[error("accelerator unavailable: {0}")]
    Unavailable(String),
}

/// Which boundary member a full set gives up to make room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Drop the smallest `(time, value)`; the set keeps the newest items.
    #[default]
    Oldest,
    /// Drop the largest member before inserting.
    Largest,
}

#[async_trait]
pub trait Accelerator: Send + Sync {
    /// Inserts `item`, replacing any entry with the same value.
    async fn add(&self, set: &str, item: TosItem, max_size: usize) -> Result<(), AcceleratorError>;

    /// Items strictly before `(time_cursor, value_cursor)`, largest first.
    async fn fetch_range(
        &self,
        set: &str,
        time_cursor: Millis,
        value_cursor: &str,
        limit: usize,
    ) -> Result<Vec<TosItem>, AcceleratorError>;

    /// Removes the entry for `value`; returns whether one existed.
    async fn remove(&self, set: &str, value: &str) -> Result<bool, AcceleratorError>;

    async fn len(&self, set: &str) -> Result<usize, AcceleratorError>;
}

fn validate_name(set: &str) -> Result<(), AcceleratorError> {
    if set.is_empty() || set.contains(['{', '}']) {
        return Err(AcceleratorError::InvalidName(set.to_string()));
    }
    Ok(())
}

fn validate_time(time: Millis) -> Result<(), AcceleratorError> {
    if time.0 < 0 {
        return Err(AcceleratorError::NegativeTime(time));
    }
    Ok(())
}

fn encode_member(time: Millis, value: &str) -> String {
    format!("{:020}_{}", time.0, value)
}

fn decode_member(set: &str, member: &str) -> Result<TosItem, AcceleratorError> {
    let corrupt = || AcceleratorError::Corrupt {
        set: set.to_string(),
        member: member.to_string(),
    };
    let (time, value) = member.split_once('_').ok_or_else(corrupt)?;
    let time = time.parse::<i64>().map_err(|_| corrupt())?;
    Ok(TosItem::new(Millis(time), value))
}

#[derive(Debug, Default)]
struct TosSet {
    members: BTreeSet<String>,
    by_value: HashMap<String, String>,
}

impl TosSet {
    fn insert(&mut self, value: &str, member: String) {
        if let Some(previous) = self.by_value.insert(value.to_string(), member.clone()) {
            self.members.remove(&previous);
        }
        self.members.insert(member);
    }

    fn evict(&mut self, policy: EvictionPolicy) {
        let evicted = match policy {
            EvictionPolicy::Oldest => self.members.pop_first(),
            EvictionPolicy::Largest => self.members.pop_last(),
        };
        if let Some(member) = evicted {
            if let Some((_, value)) = member.split_once('_') {
                if self.by_value.get(value) == Some(&member) {
                    self.by_value.remove(value);
                }
            }
        }
    }
}

/// In-process accelerator; each set has its own lock.
#[derive(Debug, Default)]
pub struct MemoryTos {
    sets: DashMap<String, Arc<Mutex<TosSet>>>,
    policy: EvictionPolicy,
}

impl MemoryTos {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            sets: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    fn set(&self, name: &str) -> Arc<Mutex<TosSet>> {
        self.sets.entry(name.to_string()).or_default().clone()
    }

    fn existing(&self, name: &str) -> Option<Arc<Mutex<TosSet>>> {
        self.sets.get(name).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl Accelerator for MemoryTos {
    async fn add(&self, set: &str, item: TosItem, max_size: usize) -> Result<(), AcceleratorError> {
        validate_name(set)?;
        validate_time(item.time)?;
        if max_size == 0 {
            return Err(AcceleratorError::InvalidMaxSize);
        }
        let member = encode_member(item.time, &item.value);
        let handle = self.set(set);
        let mut entries = handle.lock();

        // Replacing an existing value never grows the set.
        if let Some(previous) = entries.by_value.remove(&item.value) {
            entries.members.remove(&previous);
        }
        match self.policy {
            EvictionPolicy::Oldest => {
                entries.insert(&item.value, member);
                while entries.members.len() > max_size {
                    entries.evict(EvictionPolicy::Oldest);
                }
            }
            EvictionPolicy::Largest => {
                while entries.members.len() >= max_size {
                    entries.evict(EvictionPolicy::Largest);
                }
                entries.insert(&item.value, member);
            }
        }
        trace!(set, size = entries.members.len(), "accelerator add");
        Ok(())
    }

    async fn fetch_range(
        &self,
        set: &str,
        time_cursor: Millis,
        value_cursor: &str,
        limit: usize,
    ) -> Result<Vec<TosItem>, AcceleratorError> {
        validate_name(set)?;
        validate_time(time_cursor)?;
        if limit > MAX_ACCELERATOR_FETCH {
            return Err(AcceleratorError::InvalidLimit(limit));
        }
        let Some(handle) = self.existing(set) else {
            return Ok(Vec::new());
        };
        let upper = encode_member(time_cursor, value_cursor);
        let entries = handle.lock();
        entries
            .members
            .range::<String, _>(..upper)
            .rev()
            .take(limit)
            .map(|member| decode_member(set, member))
            .collect()
    }

    async fn remove(&self, set: &str, value: &str) -> Result<bool, AcceleratorError> {
        validate_name(set)?;
        let Some(handle) = self.existing(set) else {
            return Ok(false);
        };
        let mut entries = handle.lock();
        match entries.by_value.remove(value) {
            Some(member) => {
                entries.members.remove(&member);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn len(&self, set: &str) -> Result<usize, AcceleratorError> {
        validate_name(set)?;
        Ok(self
            .existing(set)
            .map(|handle| handle.lock().members.len())
            .unwrap_or(0))
    }
}
