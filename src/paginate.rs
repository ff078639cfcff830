//! # Paginated Listing
//!
//! Post pages are served from the accelerator when it can fill the whole page
//! and from the backing store otherwise:
//!
//! ```text
//! decode cursor ─► accelerator (bounded by timeout)
//!                      │ full page            │ error / timeout / shortfall
//!                      ▼                      ▼
//!                resolve ids ──────────► backing store scan
//!                      │                      │
//!                      └────────► enrich authors (best effort) ─► page
//! ```
//!
//! Accelerator ids that no longer resolve are kept as tombstones so the page
//! and its cursor stay consistent with the accelerator's ordering.

use crate::cache::keys;
use crate::config::PaginationConfig;
use crate::cursor::PageCursor;
use crate::error::{ForumError, ForumResult};
use crate::model::{EntityId, Millis, Post, PostOrder, Reply};
use crate::storage::{PostStore, UserStore};
use crate::tos::Accelerator;
use async_trait::async_trait;
use hashbrown::{HashMap, HashSet};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Read side of the post store the paginator depends on.
#[async_trait]
pub trait PostSource: Send + Sync {
    async fn list_posts(
        &self,
        order: PostOrder,
        cursor: &PageCursor,
        limit: usize,
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Post>>;

    async fn fetch_posts(
        &self,
        ids: &[EntityId],
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Option<Post>>>;
}

/// Resolves author ids to display names.
#[async_trait]
pub trait AuthorDirectory: Send + Sync {
    async fn nicknames(
        &self,
        ids: &[EntityId],
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Option<String>>>;
}

#[async_trait]
impl PostSource for PostStore {
    async fn list_posts(
        &self,
        order: PostOrder,
        cursor: &PageCursor,
        limit: usize,
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Post>> {
        self.list(order, cursor, limit, cancel).await
    }

    async fn fetch_posts(
        &self,
        ids: &[EntityId],
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Option<Post>>> {
        self.batch_fetch(ids, cancel).await
    }
}

#[async_trait]
impl AuthorDirectory for UserStore {
    async fn nicknames(
        &self,
        ids: &[EntityId],
        cancel: &CancellationToken,
    ) -> ForumResult<Vec<Option<String>>> {
        Ok(self
            .batch_fetch(ids, cancel)
            .await?
            .into_iter()
            .map(|user| user.map(|user| user.nickname))
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostDetail {
    pub post_id: EntityId,
    pub author_id: EntityId,
    /// Empty when the author could not be resolved.
    pub author_nickname: String,
    pub title: String,
    pub content: String,
    pub created_at: Millis,
    pub reply_time: Millis,
    pub reply_num: i64,
    /// Listed by the accelerator but no longer present in the store.
    pub deleted: bool,
}

impl PostDetail {
    pub fn from_post(post: Post) -> Self {
        Self {
            post_id: post.post_id,
            author_id: post.author_id,
            author_nickname: String::new(),
            title: post.title,
            content: post.content,
            created_at: post.created_at,
            reply_time: post.reply_time,
            reply_num: post.reply_num,
            deleted: false,
        }
    }

    /// Placeholder for an id that no longer resolves; carries only its position.
    pub fn tombstone(post_id: EntityId, order: PostOrder, order_time: Millis) -> Self {
        let (created_at, reply_time) = match order {
            PostOrder::CreatedAt => (order_time, Millis::default()),
            PostOrder::ReplyTime => (Millis::default(), order_time),
        };
        Self {
            post_id,
            author_id: EntityId(0),
            author_nickname: String::new(),
            title: String::new(),
            content: String::new(),
            created_at,
            reply_time,
            reply_num: 0,
            deleted: true,
        }
    }

    pub fn order_time(&self, order: PostOrder) -> Millis {
        match order {
            PostOrder::CreatedAt => self.created_at,
            PostOrder::ReplyTime => self.reply_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyDetail {
    pub reply_id: EntityId,
    pub post_id: EntityId,
    pub author_id: EntityId,
    pub author_nickname: String,
    pub content: String,
    pub created_at: Millis,
}

impl ReplyDetail {
    pub fn from_reply(reply: Reply) -> Self {
        Self {
            reply_id: reply.reply_id,
            post_id: reply.post_id,
            author_id: reply.author_id,
            author_nickname: String::new(),
            content: reply.content,
            created_at: reply.created_at,
        }
    }
}

/// Where a page was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    Accelerator,
    BackingStore,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Pass back verbatim to fetch the next page.
    pub cursor: String,
    pub source: PageSource,
    #[serde(skip)]
    page_size: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, cursor: String, source: PageSource, page_size: usize) -> Self {
        Self {
            items,
            cursor,
            source,
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fewer items than requested: there is nothing after this page.
    pub fn is_last(&self) -> bool {
        self.items.len() < self.page_size
    }
}

/// Validates a requested page size and clips it to `limits.max_page_size`.
pub fn clip_page_size(requested: i64, limits: &PaginationConfig) -> ForumResult<usize> {
    if requested <= 0 {
        return Err(ForumError::InvalidPageSize(requested));
    }
    Ok((requested as u64).min(limits.max_page_size as u64) as usize)
}

pub(crate) fn ensure_live(cancel: &CancellationToken) -> ForumResult<()> {
    if cancel.is_cancelled() {
        return Err(ForumError::Cancelled);
    }
    Ok(())
}

/// Fills `author_nickname` for every item; failures leave names empty.
pub(crate) async fn enrich_authors<T, I, S>(
    authors: &dyn AuthorDirectory,
    items: &mut [T],
    author_of: I,
    set_name: S,
    cancel: &CancellationToken,
) where
    I: Fn(&T) -> Option<EntityId>,
    S: Fn(&mut T, String),
{
    let mut seen = HashSet::new();
    let ids: Vec<EntityId> = items
        .iter()
        .filter_map(&author_of)
        .filter(|id| seen.insert(*id))
        .collect();
    if ids.is_empty() {
        return;
    }
    let names = match authors.nicknames(&ids, cancel).await {
        Ok(names) => names,
        Err(err) => {
            warn!(
                error = %err,
                authors = ids.len(),
                "author lookup failed, serving page without names"
            );
            return;
        }
    };
    let by_id: HashMap<EntityId, String> = ids
        .into_iter()
        .zip(names)
        .filter_map(|(id, name)| name.map(|name| (id, name)))
        .collect();
    for item in items.iter_mut() {
        if let Some(name) = author_of(item).and_then(|id| by_id.get(&id)) {
            set_name(item, name.clone());
        }
    }
}

pub struct PostPaginator {
    accelerator: Arc<dyn Accelerator>,
    posts: Arc<dyn PostSource>,
    authors: Arc<dyn AuthorDirectory>,
    limits: PaginationConfig,
    accelerator_timeout: Duration,
}

impl PostPaginator {
    pub fn new(
        accelerator: Arc<dyn Accelerator>,
        posts: Arc<dyn PostSource>,
        authors: Arc<dyn AuthorDirectory>,
        limits: PaginationConfig,
        accelerator_timeout: Duration,
    ) -> Self {
        Self {
            accelerator,
            posts,
            authors,
            limits,
            accelerator_timeout,
        }
    }

    /// One page of posts in `order`, strictly after `cursor`.
    #[instrument(skip(self, cancel), fields(order = %order))]
    pub async fn list(
        &self,
        order: PostOrder,
        cursor: &str,
        page_size: i64,
        cancel: &CancellationToken,
    ) -> ForumResult<Page<PostDetail>> {
        let page_size = clip_page_size(page_size, &self.limits)?;
        let position = PageCursor::decode(cursor)?;

        ensure_live(cancel)?;
        let (mut items, next, source) =
            match self.from_accelerator(order, &position, page_size, cancel).await? {
                Some((items, next)) => (items, next, PageSource::Accelerator),
                None => {
                    ensure_live(cancel)?;
                    let posts = self
                        .posts
                        .list_posts(order, &position, page_size, cancel)
                        .await?;
                    let next = posts
                        .last()
                        .map(|post| PageCursor::new(post.post_id, post.order_time(order)));
                    let items = posts.into_iter().map(PostDetail::from_post).collect();
                    (items, next, PageSource::BackingStore)
                }
            };

        enrich_authors(
            self.authors.as_ref(),
            &mut items[..],
            |item: &PostDetail| (!item.deleted).then_some(item.author_id),
            |item, name| item.author_nickname = name,
            cancel,
        )
        .await;

        let cursor = next
            .map(|next| next.encode())
            .unwrap_or_else(|| cursor.to_string());
        debug!(items = items.len(), ?source, "post page");
        Ok(Page::new(items, cursor, source, page_size))
    }

    /// `Ok(None)` means "use the backing store"; only cancellation is an error.
    async fn from_accelerator(
        &self,
        order: PostOrder,
        position: &PageCursor,
        page_size: usize,
        cancel: &CancellationToken,
    ) -> ForumResult<Option<(Vec<PostDetail>, Option<PageCursor>)>> {
        let set = keys::post_list(order);
        let value_cursor = position.entity_id.to_fixed_width();
        let fetch = self
            .accelerator
            .fetch_range(&set, position.order_time, &value_cursor, page_size);
        let entries = match tokio::time::timeout(self.accelerator_timeout, fetch).await {
            Ok(Ok(entries)) => entries,
            Ok(Err(err)) => {
                warn!(%set, error = %err, "accelerator lookup failed");
                return Ok(None);
            }
            Err(_) => {
                warn!(%set, timeout = ?self.accelerator_timeout, "accelerator lookup timed out");
                return Ok(None);
            }
        };
        if entries.len() < page_size {
            debug!(%set, found = entries.len(), page_size, "accelerator shortfall");
            return Ok(None);
        }

        let mut ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            match entry.value.parse::<EntityId>() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    warn!(%set, value = %entry.value, "accelerator holds a non-id value");
                    return Ok(None);
                }
            }
        }

        ensure_live(cancel)?;
        let posts = match self.posts.fetch_posts(&ids, cancel).await {
            Ok(posts) => posts,
            Err(ForumError::Cancelled) => return Err(ForumError::Cancelled),
            Err(err) => {
                warn!(%set, error = %err, "fail to resolve accelerator ids");
                return Ok(None);
            }
        };

        let next = ids
            .last()
            .zip(entries.last())
            .map(|(id, entry)| PageCursor::new(*id, entry.time));
        let items = ids
            .iter()
            .zip(entries.iter())
            .zip(posts)
            .map(|((id, entry), post)| match post {
                Some(post) => PostDetail::from_post(post),
                None => PostDetail::tombstone(*id, order, entry.time),
            })
            .collect();
        Ok(Some((items, next)))
    }
}
