use async_trait::async_trait;
use forumshard::cache::MemoryCache;
use forumshard::storage::{SharedBackend, WriteOp};
use forumshard::tos::{AcceleratorError, TosItem};
use forumshard::{
    Accelerator, EntityId, Forum, ForumConfig, IdGenerator, MemoryBackend, MemoryTos, Millis,
    Post, Registration, TableBackend, User,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const EPOCH: &str = "2023-01-01";

#[allow(dead_code)]
pub fn memory_backend(config: &ForumConfig) -> Arc<MemoryBackend> {
    Arc::new(MemoryBackend::new(config.sharding.physical_tables()))
}

#[allow(dead_code)]
pub fn forum_with(
    config: ForumConfig,
    backend: SharedBackend,
    accelerator: Arc<dyn Accelerator>,
) -> Forum {
    let ids = IdGenerator::new(EPOCH, 1).expect("id generator");
    let cache = Arc::new(MemoryCache::new(config.cache.capacity));
    Forum::with_components(config, ids, backend, accelerator, cache)
}

/// In-memory forum plus handles on its backend and accelerator.
#[allow(dead_code)]
pub fn memory_forum() -> (Forum, Arc<MemoryBackend>, Arc<MemoryTos>) {
    let config = ForumConfig::default();
    let backend = memory_backend(&config);
    let tos = Arc::new(MemoryTos::default());
    let forum = forum_with(config, backend.clone(), tos.clone());
    (forum, backend, tos)
}

#[allow(dead_code)]
pub fn registration(n: usize) -> Registration {
    Registration {
        username: format!("user{n}@example.com"),
        nickname: format!("user{n}"),
        password_hash: format!("digest{n}"),
    }
}

#[allow(dead_code)]
pub fn user(id: i64, email: &str, nickname: &str) -> User {
    User {
        user_id: EntityId(id),
        email: Some(email.to_string()),
        phone: None,
        nickname: nickname.to_string(),
        password_hash: "digest".to_string(),
        created_at: Millis(1_700_000_000_000),
    }
}

#[allow(dead_code)]
pub fn post(id: i64, author: i64, created: i64) -> Post {
    Post {
        post_id: EntityId(id),
        author_id: EntityId(author),
        title: format!("P{id}"),
        content: String::new(),
        created_at: Millis(created),
        reply_time: Millis(created),
        reply_num: 0,
    }
}

#[allow(dead_code)]
pub fn ids_of<T>(items: &[T], id: impl Fn(&T) -> EntityId) -> Vec<i64> {
    items.iter().map(|item| id(item).0).collect()
}

/// Wraps a backend and fails every call touching a table with a chosen prefix.
#[allow(dead_code)]
pub struct FlakyBackend {
    inner: Arc<MemoryBackend>,
    failing_prefix: Mutex<Option<String>>,
    pub calls: AtomicUsize,
}

#[allow(dead_code)]
impl FlakyBackend {
    pub fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            failing_prefix: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_tables(&self, prefix: &str) {
        *self.failing_prefix.lock() = Some(prefix.to_string());
    }

    pub fn heal(&self) {
        *self.failing_prefix.lock() = None;
    }

    fn check(&self, table: &str) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failing_prefix.lock().as_deref() {
            Some(prefix) if table.starts_with(prefix) => {
                anyhow::bail!("injected failure on {table}")
            }
            _ => Ok(()),
        }
    }
}

impl TableBackend for FlakyBackend {
    fn get(&self, table: &str, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.check(table)?;
        self.inner.get(table, key)
    }

    fn multi_get(&self, table: &str, keys: &[Vec<u8>]) -> anyhow::Result<Vec<Option<Vec<u8>>>> {
        self.check(table)?;
        self.inner.multi_get(table, keys)
    }

    fn insert_unique(&self, table: &str, key: &[u8], value: &[u8]) -> anyhow::Result<bool> {
        self.check(table)?;
        self.inner.insert_unique(table, key, value)
    }

    fn write_batch(&self, ops: Vec<WriteOp>) -> anyhow::Result<()> {
        for op in &ops {
            match op {
                WriteOp::Put { table, .. } | WriteOp::Delete { table, .. } => self.check(table)?,
            }
        }
        self.inner.write_batch(ops)
    }

    fn scan_rev(
        &self,
        table: &str,
        lower: &[u8],
        upper: &[u8],
        limit: usize,
    ) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check(table)?;
        self.inner.scan_rev(table, lower, upper, limit)
    }
}

/// Accelerator that is always down.
#[allow(dead_code)]
pub struct DownAccelerator;

#[async_trait]
impl Accelerator for DownAccelerator {
    async fn add(&self, _: &str, _: TosItem, _: usize) -> Result<(), AcceleratorError> {
        Err(AcceleratorError::Unavailable("connection refused".into()))
    }

    async fn fetch_range(
        &self,
        _: &str,
        _: Millis,
        _: &str,
        _: usize,
    ) -> Result<Vec<TosItem>, AcceleratorError> {
        Err(AcceleratorError::Unavailable("connection refused".into()))
    }

    async fn remove(&self, _: &str, _: &str) -> Result<bool, AcceleratorError> {
        Err(AcceleratorError::Unavailable("connection refused".into()))
    }

    async fn len(&self, _: &str) -> Result<usize, AcceleratorError> {
        Err(AcceleratorError::Unavailable("connection refused".into()))
    }
}

/// Delegates to a real accelerator after a fixed delay on reads.
#[allow(dead_code)]
pub struct SlowAccelerator {
    pub inner: Arc<MemoryTos>,
    pub delay: Duration,
}

#[async_trait]
impl Accelerator for SlowAccelerator {
    async fn add(&self, set: &str, item: TosItem, max_size: usize) -> Result<(), AcceleratorError> {
        self.inner.add(set, item, max_size).await
    }

    async fn fetch_range(
        &self,
        set: &str,
        time_cursor: Millis,
        value_cursor: &str,
        limit: usize,
    ) -> Result<Vec<TosItem>, AcceleratorError> {
        tokio::time::sleep(self.delay).await;
        self.inner
            .fetch_range(set, time_cursor, value_cursor, limit)
            .await
    }

    async fn remove(&self, set: &str, value: &str) -> Result<bool, AcceleratorError> {
        self.inner.remove(set, value).await
    }

    async fn len(&self, set: &str) -> Result<usize, AcceleratorError> {
        self.inner.len(set).await
    }
}
