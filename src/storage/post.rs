use super::batch::fetch_rows;
use super::{order_key, scan_index, SharedBackend, WriteOp};
use crate::config::{ShardingConfig, POST_BY_CREATED_AT_INDEX, POST_BY_REPLY_TIME_INDEX};
use crate::cursor::PageCursor;
use crate::error::{ForumError, ForumResult};
use crate::model::{EntityId, Millis, Post, PostOrder};
use crate::pool::WorkerPool;
use crate::shard::ShardedTable;
use anyhow::Context;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

fn index_table(order: PostOrder) -> &'static str {
    match order {
        PostOrder::CreatedAt => POST_BY_CREATED_AT_INDEX,
        PostOrder::ReplyTime => POST_BY_REPLY_TIME_INDEX,
    }
}

/// Posts sharded by id with one unsharded index per [`PostOrder`].
pub struct PostStore {
    backend: SharedBackend,
    posts: ShardedTable,
    pool: WorkerPool,
    // Read-modify-write of reply counters.
    update_lock: Mutex<()>,
}

impl PostStore {
    pub fn new(backend: SharedBackend, sharding: &ShardingConfig, pool: WorkerPool) -> Self {
        Self {
            backend,
            posts: sharding.posts(),
            pool,
            update_lock: Mutex::new(()),
        }
    }

    fn row_ops(&self, post: &Post) -> ForumResult<Vec<WriteOp>> {
        let row = serde_json::to_vec(post).context("fail to encode post")?;
        Ok(vec![
            WriteOp::put(
                self.posts.table_for_id(post.post_id),
                post.post_id.to_be_bytes().to_vec(),
                row,
            ),
            WriteOp::put(
                POST_BY_CREATED_AT_INDEX,
                order_key(post.created_at, post.post_id),
                Vec::new(),
            ),
            WriteOp::put(
                POST_BY_REPLY_TIME_INDEX,
                order_key(post.reply_time, post.post_id),
                Vec::new(),
            ),
        ])
    }

    /// Writes the row and both order index entries atomically.
    #[instrument(skip_all, fields(post_id = %post.post_id))]
    pub fn create(&self, post: &Post) -> ForumResult<()> {
        let ops = self.row_ops(post)?;
        self.backend
            .write_batch(ops)
            .with_context(|| format!("fail to create post {}", post.post_id))?;
        Ok(())
    }

    pub fn fetch_by_id(&self, post_id: EntityId) -> ForumResult<Option<Post>> {
        let table = self.posts.table_for_id(post_id);
        let Some(row) = self.backend.get(&table, &post_id.to_be_bytes())? else {
            return Ok(None);
        };
        let post = serde_json::from_slice(&row)
            .with_context(|| format!("corrupt post {post_id} in {table}"))?;
        Ok(Some(post))
    }

    pub fn exists(&self, post_id: EntityId) -> ForumResult<bool> {
        let table = self.posts.table_for_id(post_id);
        Ok(self.backend.contains(&table, &post_id.to_be_bytes())?)
    }

    pub async fn batch_fetch(
        &self,
        ids: &[EntityId],
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Option<Post>>> {
        fetch_rows(&self.backend, &self.posts, &self.pool, ids, cancel).await
    }

    /// Posts strictly older than `cursor` in `order`, newest first. Index
    /// entries whose row vanished mid-read are skipped and the page is topped
    /// up from further down the index.
    #[instrument(level = "debug", skip(self, cancel), fields(order = %order))]
    pub async fn list(
        &self,
        order: PostOrder,
        cursor: &PageCursor,
        limit: usize,
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Post>> {
        let index = index_table(order);
        let mut upper = order_key(cursor.order_time, cursor.entity_id);
        let mut posts = Vec::with_capacity(limit);
        while posts.len() < limit {
            let want = limit - posts.len();
            let entries = scan_index(&self.backend, index, Vec::new(), upper, want).await?;
            let Some((last_key, _)) = entries.last() else {
                break;
            };
            upper = last_key.clone();
            let ids: Vec<EntityId> = entries.iter().map(|(_, id)| *id).collect();
            let found = posts.len();
            posts.extend(self.batch_fetch(&ids, cancel).await?.into_iter().flatten());
            let missing = ids.len() - (posts.len() - found);
            if missing > 0 {
                debug!(missing, "index entries without rows");
            }
            if entries.len() < want {
                break;
            }
        }
        Ok(posts)
    }

    /// Bumps the reply counter and moves the post to `reply_time` in the
    /// reply-time index. Returns the updated post, or `None` if it is gone.
    #[instrument(skip(self))]
    pub fn record_reply(&self, post_id: EntityId, reply_time: Millis) -> ForumResult<Option<Post>> {
        let _guard = self.update_lock.lock();
        let Some(mut post) = self.fetch_by_id(post_id)? else {
            return Ok(None);
        };
        let previous = post.reply_time;
        post.reply_num += 1;
        post.reply_time = previous.max(reply_time);

        let row = serde_json::to_vec(&post).context("fail to encode post")?;
        let mut ops = vec![WriteOp::put(
            self.posts.table_for_id(post_id),
            post_id.to_be_bytes().to_vec(),
            row,
        )];
        if post.reply_time != previous {
            ops.push(WriteOp::delete(
                POST_BY_REPLY_TIME_INDEX,
                order_key(previous, post_id),
            ));
            ops.push(WriteOp::put(
                POST_BY_REPLY_TIME_INDEX,
                order_key(post.reply_time, post_id),
                Vec::new(),
            ));
        }
        self.backend
            .write_batch(ops)
            .with_context(|| format!("fail to record reply on post {post_id}"))?;
        Ok(Some(post))
    }

    /// Removes the row and its index entries. Returns `false` if it did not exist.
    #[instrument(skip(self))]
    pub fn delete(&self, post_id: EntityId) -> ForumResult<bool> {
        let _guard = self.update_lock.lock();
        let Some(post) = self.fetch_by_id(post_id)? else {
            return Ok(false);
        };
        let ops = vec![
            WriteOp::delete(
                self.posts.table_for_id(post_id),
                post_id.to_be_bytes().to_vec(),
            ),
            WriteOp::delete(POST_BY_CREATED_AT_INDEX, order_key(post.created_at, post_id)),
            WriteOp::delete(POST_BY_REPLY_TIME_INDEX, order_key(post.reply_time, post_id)),
        ];
        self.backend
            .write_batch(ops)
            .with_context(|| format!("fail to delete post {post_id}"))?;
        Ok(true)
    }

    pub(crate) fn require(&self, post_id: EntityId) -> ForumResult<Post> {
        self.fetch_by_id(post_id)?
            .ok_or(ForumError::NotFound("post"))
    }
}
