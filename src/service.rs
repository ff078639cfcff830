//! # Forum Service
//!
//! Entry point wiring the id generator, sharded stores, accelerator, cache and
//! paginator together. Store calls run on tokio's blocking pool; accelerator
//! and cache maintenance never fails a request.

use crate::cache::{get_id, jittered_ttl, keys, spawn_best_effort, KvCache, MemoryCache};
use crate::config::{ForumConfig, MAX_CONTENT_CHARS, MAX_NICKNAME_CHARS, MAX_TITLE_CHARS};
use crate::cursor::PageCursor;
use crate::error::{ForumError, ForumResult};
use crate::idgen::{IdGenerator, NodeRegistry};
use crate::model::{EntityId, Millis, NaturalKeyKind, Post, PostOrder, Reply, User};
use crate::paginate::{
    clip_page_size, enrich_authors, ensure_live, AuthorDirectory, Page, PageSource, PostDetail,
    PostPaginator, PostSource, ReplyDetail,
};
use crate::pool::WorkerPool;
use crate::storage::{
    classify_username, open_backend, PostStore, ReplyStore, SharedBackend, UserStore,
};
use crate::tos::{Accelerator, MemoryTos, TosItem};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct Registration {
    /// Email address or phone number used to log in.
    pub username: String,
    pub nickname: String,
    pub password_hash: String,
}

/// Public user fields, also the cached form of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBasic {
    pub user_id: EntityId,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub nickname: String,
    pub created_at: Millis,
}

impl From<&User> for UserBasic {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.user_id,
            email: user.email.clone(),
            phone: user.phone.clone(),
            nickname: user.nickname.clone(),
            created_at: user.created_at,
        }
    }
}

async fn blocking<S, R, F>(store: &Arc<S>, work: F) -> ForumResult<R>
where
    S: Send + Sync + 'static,
    R: Send + 'static,
    F: FnOnce(&S) -> ForumResult<R> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || work(&store))
        .await
        .map_err(|err| ForumError::Store(anyhow!("store task failed: {err}")))?
}

fn check_text(field: &str, value: &str, max_chars: usize) -> ForumResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ForumError::InvalidArgument(format!("{field} must not be empty")));
    }
    if value.chars().count() > max_chars {
        return Err(ForumError::InvalidArgument(format!(
            "{field} exceeds {max_chars} characters"
        )));
    }
    Ok(value.to_string())
}

pub struct Forum {
    config: ForumConfig,
    ids: IdGenerator,
    users: Arc<UserStore>,
    posts: Arc<PostStore>,
    replies: Arc<ReplyStore>,
    accelerator: Arc<dyn Accelerator>,
    cache: Arc<dyn KvCache>,
    paginator: PostPaginator,
    // Orders reply-time updates with their accelerator writes.
    reply_order: tokio::sync::Mutex<()>,
}

impl Forum {
    /// Builds every component from `config` and binds the configured node id.
    pub fn open(config: ForumConfig, registry: &NodeRegistry) -> anyhow::Result<Self> {
        let ids = IdGenerator::from_config(&config.idgen, registry)?;
        let backend = open_backend(&config)?;
        let accelerator = Arc::new(MemoryTos::new(config.accelerator.eviction));
        let cache = Arc::new(MemoryCache::new(config.cache.capacity));
        info!(
            node = ids.node(),
            persistent = config.storage.data_dir.is_some(),
            "forum opened"
        );
        Ok(Self::with_components(config, ids, backend, accelerator, cache))
    }

    pub fn with_components(
        config: ForumConfig,
        ids: IdGenerator,
        backend: SharedBackend,
        accelerator: Arc<dyn Accelerator>,
        cache: Arc<dyn KvCache>,
    ) -> Self {
        let pool = WorkerPool::new(config.workers.batch_fetch);
        let users = Arc::new(UserStore::new(Arc::clone(&backend), &config.sharding, pool));
        let posts = Arc::new(PostStore::new(Arc::clone(&backend), &config.sharding, pool));
        let replies = Arc::new(ReplyStore::new(backend, &config.sharding, pool));
        let paginator = PostPaginator::new(
            Arc::clone(&accelerator),
            Arc::clone(&posts) as Arc<dyn PostSource>,
            Arc::clone(&users) as Arc<dyn AuthorDirectory>,
            config.pagination.clone(),
            config.accelerator.timeout(),
        );
        Self {
            config,
            ids,
            users,
            posts,
            replies,
            accelerator,
            cache,
            paginator,
            reply_order: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ForumConfig {
        &self.config
    }

    pub fn users(&self) -> &UserStore {
        &self.users
    }

    pub fn posts(&self) -> &PostStore {
        &self.posts
    }

    pub fn replies(&self) -> &ReplyStore {
        &self.replies
    }

    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accelerator
    }

    pub fn paginator(&self) -> &PostPaginator {
        &self.paginator
    }

    #[instrument(skip_all, fields(username = %request.username))]
    pub async fn register(
        &self,
        request: Registration,
        cancel: &CancellationToken,
    ) -> ForumResult<UserBasic> {
        let kind = classify_username(&request.username).ok_or_else(|| {
            ForumError::InvalidArgument("username must be an email or phone number".into())
        })?;
        let nickname = check_text("nickname", &request.nickname, MAX_NICKNAME_CHARS)?;
        if request.password_hash.is_empty() {
            return Err(ForumError::InvalidArgument("password hash must not be empty".into()));
        }
        ensure_live(cancel)?;

        let username = request.username.clone();
        let lookup_nickname = nickname.clone();
        let (by_username, by_nickname) = tokio::try_join!(
            blocking(&self.users, move |users| users.lookup(kind, &username)),
            blocking(&self.users, move |users| users.nickname_to_id(&lookup_nickname)),
        )?;
        if by_username.is_some() {
            return Err(ForumError::Duplicate(kind));
        }
        if by_nickname.is_some() {
            return Err(ForumError::Duplicate(NaturalKeyKind::Nickname));
        }
        ensure_live(cancel)?;

        let (email, phone) = match kind {
            NaturalKeyKind::Email => (Some(request.username), None),
            _ => (None, Some(request.username)),
        };
        let user = User {
            user_id: self.ids.next_id(),
            email,
            phone,
            nickname,
            password_hash: request.password_hash,
            created_at: Millis::now(),
        };
        let row = user.clone();
        blocking(&self.users, move |users| users.create(&row)).await?;

        self.cache_user(&user);
        info!(user_id = %user.user_id, "registered user");
        Ok(UserBasic::from(&user))
    }

    fn cache_user(&self, user: &User) {
        let settings = &self.config.cache;
        for (kind, key) in user.natural_keys() {
            self.cache_id(keys::natural_key(kind, key), user.user_id);
        }
        match serde_json::to_string(&UserBasic::from(user)) {
            Ok(basic) => {
                let cache = Arc::clone(&self.cache);
                let key = keys::user_basic(user.user_id);
                let ttl = jittered_ttl(settings.user_info_ttl(), settings.ttl_jitter);
                spawn_best_effort("user basic", settings.write_timeout(), async move {
                    cache.set(&key, basic, ttl).await
                });
            }
            Err(err) => {
                warn!(user_id = %user.user_id, error = %err, "fail to encode user for cache")
            }
        }
    }

    fn cache_id(&self, key: String, id: EntityId) {
        let settings = &self.config.cache;
        let cache = Arc::clone(&self.cache);
        let ttl = jittered_ttl(settings.user_info_ttl(), settings.ttl_jitter);
        spawn_best_effort("natural key", settings.write_timeout(), async move {
            cache.set(&key, id.to_string(), ttl).await
        });
    }

    async fn resolve(&self, kind: NaturalKeyKind, key: &str) -> ForumResult<Option<EntityId>> {
        let cache_key = keys::natural_key(kind, key);
        match get_id(self.cache.as_ref(), &cache_key).await {
            Ok(Some(id)) => return Ok(Some(id)),
            Ok(None) => {}
            Err(err) => warn!(%kind, error = %err, "cache read failed"),
        }
        let owned = key.to_string();
        let found = blocking(&self.users, move |users| users.lookup(kind, &owned)).await?;
        if let Some(id) = found {
            self.cache_id(cache_key, id);
        }
        Ok(found)
    }

    /// Resolves an email or phone login name.
    pub async fn username_to_id(&self, username: &str) -> ForumResult<Option<EntityId>> {
        let kind = classify_username(username).ok_or_else(|| {
            ForumError::InvalidArgument(format!(
                "{username:?} is neither an email nor a phone number"
            ))
        })?;
        self.resolve(kind, username).await
    }

    pub async fn nickname_to_id(&self, nickname: &str) -> ForumResult<Option<EntityId>> {
        self.resolve(NaturalKeyKind::Nickname, nickname).await
    }

    pub async fn user_basic(&self, user_id: EntityId) -> ForumResult<UserBasic> {
        let key = keys::user_basic(user_id);
        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<UserBasic>(&raw) {
                Ok(basic) => return Ok(basic),
                Err(err) => warn!(%user_id, error = %err, "discarding corrupt cached user"),
            },
            Ok(None) => {}
            Err(err) => warn!(%user_id, error = %err, "cache read failed"),
        }
        let user = blocking(&self.users, move |users| users.fetch_by_id(user_id))
            .await?
            .ok_or(ForumError::NotFound("user"))?;
        self.cache_user(&user);
        Ok(UserBasic::from(&user))
    }

    async fn require_user(&self, user_id: EntityId) -> ForumResult<()> {
        if blocking(&self.users, move |users| users.exists(user_id)).await? {
            Ok(())
        } else {
            Err(ForumError::NotFound("user"))
        }
    }

    async fn index_post(&self, order: PostOrder, post_id: EntityId, time: Millis) {
        let set = keys::post_list(order);
        let item = TosItem::new(time, post_id.to_fixed_width());
        let add = self
            .accelerator
            .add(&set, item, self.config.accelerator.post_list_size);
        match tokio::time::timeout(self.config.accelerator.timeout(), add).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(%set, %post_id, error = %err, "fail to update accelerator"),
            Err(_) => warn!(%set, %post_id, "accelerator update timed out"),
        }
    }

    #[instrument(skip(self, title, content))]
    pub async fn create_post(
        &self,
        author_id: EntityId,
        title: &str,
        content: &str,
    ) -> ForumResult<Post> {
        let title = check_text("title", title, MAX_TITLE_CHARS)?;
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(ForumError::InvalidArgument(format!(
                "content exceeds {MAX_CONTENT_CHARS} characters"
            )));
        }
        self.require_user(author_id).await?;

        let now = Millis::now();
        let post = Post {
            post_id: self.ids.next_id(),
            author_id,
            title,
            content: content.to_string(),
            created_at: now,
            reply_time: now,
            reply_num: 0,
        };
        let row = post.clone();
        blocking(&self.posts, move |posts| posts.create(&row)).await?;

        self.index_post(PostOrder::CreatedAt, post.post_id, post.created_at)
            .await;
        self.index_post(PostOrder::ReplyTime, post.post_id, post.reply_time)
            .await;
        debug!(post_id = %post.post_id, "created post");
        Ok(post)
    }

    pub async fn post_detail(
        &self,
        post_id: EntityId,
        cancel: &CancellationToken,
    ) -> ForumResult<PostDetail> {
        ensure_live(cancel)?;
        let post = blocking(&self.posts, move |posts| posts.require(post_id)).await?;
        let mut detail = [PostDetail::from_post(post)];
        enrich_authors(
            self.users.as_ref(),
            &mut detail[..],
            |item: &PostDetail| Some(item.author_id),
            |item, name| item.author_nickname = name,
            cancel,
        )
        .await;
        let [detail] = detail;
        Ok(detail)
    }

    /// Adds a reply and moves the post to the front of the reply-time list.
    #[instrument(skip(self, content))]
    pub async fn reply(
        &self,
        author_id: EntityId,
        post_id: EntityId,
        content: &str,
    ) -> ForumResult<Reply> {
        let content = check_text("content", content, MAX_CONTENT_CHARS)?;
        self.require_user(author_id).await?;
        if !blocking(&self.posts, move |posts| posts.exists(post_id)).await? {
            return Err(ForumError::NotFound("post"));
        }

        let reply = Reply {
            reply_id: self.ids.next_id(),
            post_id,
            author_id,
            content,
            created_at: Millis::now(),
        };
        let row = reply.clone();
        blocking(&self.replies, move |replies| replies.create(&row)).await?;

        let reply_time = reply.created_at;
        let _order = self.reply_order.lock().await;
        match blocking(&self.posts, move |posts| posts.record_reply(post_id, reply_time)).await {
            Ok(Some(post)) => {
                self.index_post(PostOrder::ReplyTime, post_id, post.reply_time)
                    .await
            }
            Ok(None) => warn!(%post_id, "post vanished before its reply was counted"),
            Err(err) => warn!(%post_id, error = %err, "fail to record reply on post"),
        }
        Ok(reply)
    }

    /// Deletes a post; accelerator entries are removed best effort.
    pub async fn delete_post(&self, post_id: EntityId) -> ForumResult<bool> {
        let deleted = blocking(&self.posts, move |posts| posts.delete(post_id)).await?;
        if deleted {
            let value = post_id.to_fixed_width();
            for order in [PostOrder::CreatedAt, PostOrder::ReplyTime] {
                let set = keys::post_list(order);
                if let Err(err) = self.accelerator.remove(&set, &value).await {
                    warn!(%set, %post_id, error = %err, "fail to remove post from accelerator");
                }
            }
        }
        Ok(deleted)
    }

    /// `page_size` of `None` uses the configured default.
    pub async fn list_posts(
        &self,
        order: PostOrder,
        cursor: &str,
        page_size: Option<i64>,
        cancel: &CancellationToken,
    ) -> ForumResult<Page<PostDetail>> {
        let page_size = page_size.unwrap_or(self.config.pagination.default_page_size as i64);
        self.paginator.list(order, cursor, page_size, cancel).await
    }

    #[instrument(skip(self, cancel))]
    pub async fn list_replies(
        &self,
        post_id: EntityId,
        cursor: &str,
        page_size: Option<i64>,
        cancel: &CancellationToken,
    ) -> ForumResult<Page<ReplyDetail>> {
        let requested = page_size.unwrap_or(self.config.pagination.default_page_size as i64);
        let page_size = clip_page_size(requested, &self.config.pagination)?;
        let position = PageCursor::decode(cursor)?;
        ensure_live(cancel)?;
        if !blocking(&self.posts, move |posts| posts.exists(post_id)).await? {
            return Err(ForumError::NotFound("post"));
        }

        let replies = self
            .replies
            .list_for_post(post_id, &position, page_size, cancel)
            .await?;
        let next = replies
            .last()
            .map(|reply| PageCursor::new(reply.reply_id, reply.created_at).encode())
            .unwrap_or_else(|| cursor.to_string());
        let mut items: Vec<ReplyDetail> =
            replies.into_iter().map(ReplyDetail::from_reply).collect();
        enrich_authors(
            self.users.as_ref(),
            &mut items[..],
            |item: &ReplyDetail| Some(item.author_id),
            |item, name| item.author_nickname = name,
            cancel,
        )
        .await;
        Ok(Page::new(items, next, PageSource::BackingStore, page_size))
    }
}
