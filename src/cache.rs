//! # Key/Value Cache
//!
//! Look-aside cache for user info and natural-key lookups. Writes are best
//! effort: they run detached with their own timeout and a failure is only
//! logged, never surfaced to the request that triggered it.

use crate::model::EntityId;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use std::future::Future;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const KEY_PREFIX: &str = "forumshard";

/// Key builders; every key is `forumshard:<part>:<part>...`.
pub mod keys {
    use super::KEY_PREFIX;
    use crate::model::{EntityId, NaturalKeyKind, PostOrder};

    fn join(parts: &[&str]) -> String {
        let mut key = String::from(KEY_PREFIX);
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    /// Accelerator set holding the post list for `order`.
    pub fn post_list(order: PostOrder) -> String {
        join(&["post", &format!("post_list_order_by_{}", order.as_str())])
    }

    pub fn natural_key(kind: NaturalKeyKind, key: &str) -> String {
        join(&[kind.as_str(), key, "user_id"])
    }

    pub fn user_basic(user_id: EntityId) -> String {
        join(&["user", &user_id.to_string(), "basic"])
    }
}

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;

    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// Bounded in-process cache with per-entry expiry.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()))
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()> {
        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.lock().put(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().pop(key);
        Ok(())
    }
}

/// `ttl` scaled by a random factor in `[1 - jitter, 1 + jitter]`.
pub fn jittered_ttl(ttl: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return ttl;
    }
    let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
    ttl.mul_f64(factor)
}

/// Runs `write` on its own task, bounded by `timeout`. Failures are logged.
pub fn spawn_best_effort<F>(what: &'static str, timeout: Duration, write: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => debug!(what, "cache write done"),
            Ok(Err(err)) => warn!(what, error = %err, "cache write failed"),
            Err(_) => warn!(what, ?timeout, "cache write timed out"),
        }
    })
}

/// Reads a cached id, treating unparsable values as a miss.
pub async fn get_id(cache: &dyn KvCache, key: &str) -> anyhow::Result<Option<EntityId>> {
    Ok(cache
        .get(key)
        .await?
        .and_then(|raw| raw.parse::<EntityId>().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NaturalKeyKind, PostOrder};
    use std::sync::Arc;

    #[test]
    fn keys_use_the_project_prefix() {
        assert_eq!(
            keys::post_list(PostOrder::ReplyTime),
            "forumshard:post:post_list_order_by_reply_time"
        );
        assert_eq!(
            keys::natural_key(NaturalKeyKind::Email, "a@b.com"),
            "forumshard:email:a@b.com:user_id"
        );
        assert_eq!(keys::user_basic(EntityId(7)), "forumshard:user:7:basic");
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let ttl = Duration::from_secs(100);
        for _ in 0..100 {
            let jittered = jittered_ttl(ttl, 0.1);
            assert!(jittered >= Duration::from_secs(90) && jittered <= Duration::from_secs(110));
        }
        assert_eq!(jittered_ttl(ttl, 0.0), ttl);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCache::new(8);
        cache.set("k", "v".into(), Duration::from_millis(20)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recent() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", "1".into(), ttl).await.unwrap();
        cache.set("b", "2".into(), ttl).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", "3".into(), ttl).await.unwrap();
        assert_eq!(cache.get("b").await.unwrap(), None);
        assert_eq!(get_id(&cache, "a").await.unwrap(), Some(EntityId(1)));
    }

    #[tokio::test]
    async fn detached_write_completes_on_its_own() {
        let cache = Arc::new(MemoryCache::new(4));
        let writer = Arc::clone(&cache);
        spawn_best_effort("test", Duration::from_secs(1), async move {
            writer.set("k", "v".into(), Duration::from_secs(60)).await
        })
        .await
        .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
    }
}
