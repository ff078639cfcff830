//! # Sharded Entity Store
//!
//! Users, posts and replies spread over physical tables chosen by
//! [`crate::shard`]. Every store talks to a [`TableBackend`]; the unsharded
//! order indexes live next to the shards in the same backend.
//!
//! Key layouts:
//!
//! ```text
//! user{n} / post{n} / post_reply{n}   id (8 bytes BE)                      -> JSON row
//! user_email{n} / ...                 natural key (UTF-8)                  -> id (8 bytes BE)
//! post_by_created_at / _reply_time    sortable millis | post id            -> empty
//! reply_by_post                       post id | sortable millis | reply id -> empty
//! ```

mod backend;
mod batch;
mod post;
mod reply;
mod rocks;
mod user;

pub use backend::{MemoryBackend, TableBackend, WriteOp};
pub use post::PostStore;
pub use reply::ReplyStore;
pub use rocks::RocksBackend;
pub use user::{classify_username, UserStore};

use crate::config::ForumConfig;
use crate::model::{EntityId, Millis};
use anyhow::{Context, Result};
use std::sync::Arc;

pub type SharedBackend = Arc<dyn TableBackend>;

/// Opens the backend described by `config.storage`: RocksDB when a data
/// directory is configured, otherwise in-memory tables.
pub fn open_backend(config: &ForumConfig) -> Result<SharedBackend> {
    let tables = config.sharding.physical_tables();
    match &config.storage.data_dir {
        Some(dir) => Ok(Arc::new(RocksBackend::open(dir, &tables)?)),
        None => Ok(Arc::new(MemoryBackend::new(tables))),
    }
}

/// `millis | id`, ordering entries by time then id.
pub(crate) fn order_key(time: Millis, id: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&time.to_sortable_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub(crate) fn id_from_order_key(key: &[u8]) -> Option<EntityId> {
    if key.len() < 8 {
        return None;
    }
    EntityId::from_be_slice(&key[key.len() - 8..])
}

/// Reverse scan of an order index on tokio's blocking pool. Yields each
/// entry's key with the id it ends in.
pub(crate) async fn scan_index(
    backend: &SharedBackend,
    table: &'static str,
    lower: Vec<u8>,
    upper: Vec<u8>,
    limit: usize,
) -> Result<Vec<(Vec<u8>, EntityId)>> {
    let backend = Arc::clone(backend);
    let entries =
        tokio::task::spawn_blocking(move || backend.scan_rev(table, &lower, &upper, limit))
            .await
            .with_context(|| format!("scan of {table} did not complete"))?
            .with_context(|| format!("fail to scan {table}"))?;
    entries
        .into_iter()
        .map(|(key, _)| {
            let id = id_from_order_key(&key).with_context(|| format!("corrupt entry in {table}"))?;
            Ok((key, id))
        })
        .collect()
}

pub(crate) fn scoped_order_key(scope: EntityId, time: Millis, id: EntityId) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&scope.to_be_bytes());
    key.extend_from_slice(&order_key(time, id));
    key
}
