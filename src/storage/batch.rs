use super::SharedBackend;
use crate::error::ForumResult;
use crate::model::EntityId;
use crate::pool::WorkerPool;
use crate::shard::ShardedTable;
use anyhow::Context;
use hashbrown::HashMap;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fetches JSON rows keyed by id across every shard of `table`.
///
/// Output is positionally aligned with `ids`. Repeated ids are fetched once;
/// missing or invalid ids come back as `None`. One query per touched shard
/// runs on `pool`, and any shard failure fails the whole call.
pub(crate) async fn fetch_rows<T>(
    backend: &SharedBackend,
    table: &ShardedTable,
    pool: &WorkerPool,
    ids: &[EntityId],
    cancel: &CancellationToken,
) -> ForumResult<Vec<Option<T>>>
where
    T: DeserializeOwned + Clone + Send + 'static,
{
    let mut positions: HashMap<EntityId, Vec<usize>> = HashMap::new();
    let mut groups: HashMap<String, Vec<EntityId>> = HashMap::new();
    for (index, id) in ids.iter().enumerate() {
        let slots = positions.entry(*id).or_default();
        if slots.is_empty() && id.is_valid() {
            groups.entry(table.table_for_id(*id)).or_default().push(*id);
        }
        slots.push(index);
    }
    debug!(table = table.logical(), ids = ids.len(), shards = groups.len(), "batch fetch");

    let backend = Arc::clone(backend);
    let fetched = pool
        .run(
            groups.into_iter().collect(),
            cancel,
            move |(physical, ids): (String, Vec<EntityId>)| {
                let keys: Vec<Vec<u8>> = ids.iter().map(|id| id.to_be_bytes().to_vec()).collect();
                let values = backend
                    .multi_get(&physical, &keys)
                    .with_context(|| format!("fail to batch fetch from {physical}"))?;
                let mut found = Vec::with_capacity(ids.len());
                for (id, value) in ids.into_iter().zip(values) {
                    if let Some(bytes) = value {
                        let row: T = serde_json::from_slice(&bytes)
                            .with_context(|| format!("corrupt row {id} in {physical}"))?;
                        found.push((id, row));
                    }
                }
                Ok(found)
            },
        )
        .await?;

    let mut output: Vec<Option<T>> = vec![None; ids.len()];
    for (id, row) in fetched.into_iter().flatten() {
        if let Some(slots) = positions.get(&id) {
            for &slot in slots {
                output[slot] = Some(row.clone());
            }
        }
    }
    Ok(output)
}
