use super::batch::fetch_rows;
use super::{scan_index, scoped_order_key, SharedBackend, WriteOp};
use crate::config::{ShardingConfig, REPLY_BY_POST_INDEX};
use crate::cursor::PageCursor;
use crate::error::ForumResult;
use crate::model::{EntityId, Reply};
use crate::pool::WorkerPool;
use crate::shard::ShardedTable;
use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Replies sharded by reply id, indexed by `(post, created_at, reply)`.
pub struct ReplyStore {
    backend: SharedBackend,
    replies: ShardedTable,
    pool: WorkerPool,
}

impl ReplyStore {
    pub fn new(backend: SharedBackend, sharding: &ShardingConfig, pool: WorkerPool) -> Self {
        Self {
            backend,
            replies: sharding.replies(),
            pool,
        }
    }

    #[instrument(skip_all, fields(reply_id = %reply.reply_id, post_id = %reply.post_id))]
    pub fn create(&self, reply: &Reply) -> ForumResult<()> {
        let row = serde_json::to_vec(reply).context("fail to encode reply")?;
        let ops = vec![
            WriteOp::put(
                self.replies.table_for_id(reply.reply_id),
                reply.reply_id.to_be_bytes().to_vec(),
                row,
            ),
            WriteOp::put(
                REPLY_BY_POST_INDEX,
                scoped_order_key(reply.post_id, reply.created_at, reply.reply_id),
                Vec::new(),
            ),
        ];
        self.backend
            .write_batch(ops)
            .with_context(|| format!("fail to create reply {}", reply.reply_id))?;
        Ok(())
    }

    pub fn fetch_by_id(&self, reply_id: EntityId) -> ForumResult<Option<Reply>> {
        let table = self.replies.table_for_id(reply_id);
        let Some(row) = self.backend.get(&table, &reply_id.to_be_bytes())? else {
            return Ok(None);
        };
        let reply = serde_json::from_slice(&row)
            .with_context(|| format!("corrupt reply {reply_id} in {table}"))?;
        Ok(Some(reply))
    }

    pub async fn batch_fetch(
        &self,
        ids: &[EntityId],
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Option<Reply>>> {
        fetch_rows(&self.backend, &self.replies, &self.pool, ids, cancel).await
    }

    /// Replies to `post_id` created strictly before `cursor`, newest first.
    pub async fn list_for_post(
        &self,
        post_id: EntityId,
        cursor: &PageCursor,
        limit: usize,
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Reply>> {
        let lower = post_id.to_be_bytes().to_vec();
        let upper = scoped_order_key(post_id, cursor.order_time, cursor.entity_id);
        let entries = scan_index(&self.backend, REPLY_BY_POST_INDEX, lower, upper, limit).await?;
        let ids: Vec<EntityId> = entries
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        Ok(self
            .batch_fetch(&ids, cancel)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }
}
