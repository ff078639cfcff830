//! Unified configuration for forumshard components.
//!
//! Configuration is loaded with precedence: overrides > Env vars > Config file > Defaults
//!
//! # Example config file (forumshard.toml)
//! ```toml
//! [idgen]
//! epoch = "2023-01-01"
//! node = 3
//!
//! [sharding]
//! user = 8
//! user_email = 8
//! user_phone = 4
//!
//! [pagination]
//! max_page_size = 50
//!
//! [accelerator]
//! post_list_size = 500
//! eviction = "oldest"
//!
//! [storage]
//! data_dir = "/var/lib/forumshard"
//! ```
//!
//! Environment variables use the `FORUMSHARD_` prefix with `__` between
//! section and key, e.g. `FORUMSHARD_SHARDING__USER=16`.

mod defaults;

pub use defaults::*;

use crate::shard::{ShardCount, ShardedTable};
use crate::tos::EvictionPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const USER_TABLE: &str = "user";
pub const USER_EMAIL_TABLE: &str = "user_email";
pub const USER_PHONE_TABLE: &str = "user_phone";
pub const USER_NICKNAME_TABLE: &str = "user_nickname";
pub const POST_TABLE: &str = "post";
pub const REPLY_TABLE: &str = "post_reply";
pub const POST_BY_CREATED_AT_INDEX: &str = "post_by_created_at";
pub const POST_BY_REPLY_TIME_INDEX: &str = "post_by_reply_time";
pub const REPLY_BY_POST_INDEX: &str = "reply_by_post";

/// Main configuration for forumshard components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForumConfig {
    pub idgen: IdGenConfig,
    pub sharding: ShardingConfig,
    pub pagination: PaginationConfig,
    pub accelerator: AcceleratorConfig,
    pub workers: WorkerConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
}

impl ForumConfig {
    /// Load configuration with precedence: overrides > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ForumConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with FORUMSHARD_ prefix
        figment = figment.merge(Env::prefixed("FORUMSHARD_").split("__"));

        // Layer 3: explicit overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: ForumConfig = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Rejects settings that would make the process unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pagination.default_page_size == 0 || self.pagination.max_page_size == 0 {
            return Err(ConfigError::new("page sizes must be positive"));
        }
        if self.pagination.default_page_size > self.pagination.max_page_size {
            return Err(ConfigError::new(format!(
                "default page size {} exceeds max page size {}",
                self.pagination.default_page_size, self.pagination.max_page_size
            )));
        }
        if self.pagination.max_page_size > MAX_ACCELERATOR_FETCH {
            return Err(ConfigError::new(format!(
                "max page size {} exceeds the accelerator fetch limit {}",
                self.pagination.max_page_size, MAX_ACCELERATOR_FETCH
            )));
        }
        if self.accelerator.post_list_size == 0 {
            return Err(ConfigError::new("accelerator post_list_size must be positive"));
        }
        if self.workers.batch_fetch == 0 {
            return Err(ConfigError::new("batch fetch worker count must be positive"));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::new("cache capacity must be positive"));
        }
        Ok(())
    }
}

/// Identifier generator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdGenConfig {
    /// UTC date (`YYYY-MM-DD`) used as time zero
    pub epoch: String,
    /// Node discriminator, unique per running process
    pub node: u16,
}

impl Default for IdGenConfig {
    fn default() -> Self {
        Self {
            epoch: DEFAULT_ID_EPOCH.to_string(),
            node: DEFAULT_ID_NODE,
        }
    }
}

/// Shard counts per logical table. Zero is rejected while deserializing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub user: ShardCount,
    pub user_email: ShardCount,
    pub user_phone: ShardCount,
    pub user_nickname: ShardCount,
    pub post: ShardCount,
    pub reply: ShardCount,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            user: shard_count(DEFAULT_USER_SHARDS),
            user_email: shard_count(DEFAULT_USER_EMAIL_SHARDS),
            user_phone: shard_count(DEFAULT_USER_PHONE_SHARDS),
            user_nickname: shard_count(DEFAULT_USER_NICKNAME_SHARDS),
            post: shard_count(DEFAULT_POST_SHARDS),
            reply: shard_count(DEFAULT_REPLY_SHARDS),
        }
    }
}

fn shard_count(count: u32) -> ShardCount {
    ShardCount::new(count).unwrap_or(ShardCount::ONE)
}

impl ShardingConfig {
    pub fn users(&self) -> ShardedTable {
        ShardedTable::new(USER_TABLE, self.user)
    }

    pub fn user_emails(&self) -> ShardedTable {
        ShardedTable::new(USER_EMAIL_TABLE, self.user_email)
    }

    pub fn user_phones(&self) -> ShardedTable {
        ShardedTable::new(USER_PHONE_TABLE, self.user_phone)
    }

    pub fn user_nicknames(&self) -> ShardedTable {
        ShardedTable::new(USER_NICKNAME_TABLE, self.user_nickname)
    }

    pub fn posts(&self) -> ShardedTable {
        ShardedTable::new(POST_TABLE, self.post)
    }

    pub fn replies(&self) -> ShardedTable {
        ShardedTable::new(REPLY_TABLE, self.reply)
    }

    /// Every physical table the backend must provide, including unsharded indexes.
    pub fn physical_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        for table in [
            self.users(),
            self.user_emails(),
            self.user_phones(),
            self.user_nicknames(),
            self.posts(),
            self.replies(),
        ] {
            tables.extend(table.tables());
        }
        tables.extend(
            [
                POST_BY_CREATED_AT_INDEX,
                POST_BY_REPLY_TIME_INDEX,
                REPLY_BY_POST_INDEX,
            ]
            .iter()
            .map(|name| name.to_string()),
        );
        tables
    }
}

/// Page size limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }
}

/// Time-ordered set accelerator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Maximum members per post list set
    pub post_list_size: usize,
    /// Budget for one accelerator lookup (milliseconds)
    pub timeout_ms: u64,
    /// Which end of a full set is dropped on insert
    pub eviction: EvictionPolicy,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            post_list_size: DEFAULT_POST_LIST_CACHE_SIZE,
            timeout_ms: DEFAULT_ACCELERATOR_TIMEOUT_MS,
            eviction: EvictionPolicy::default(),
        }
    }
}

impl AcceleratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker count for one batch fetch
    pub batch_fetch: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_fetch: DEFAULT_BATCH_FETCH_WORKERS,
        }
    }
}

/// Key/value cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub user_info_ttl_secs: u64,
    pub ttl_jitter: f64,
    pub write_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            user_info_ttl_secs: DEFAULT_USER_INFO_TTL_SECS,
            ttl_jitter: DEFAULT_TTL_JITTER,
            write_timeout_ms: DEFAULT_CACHE_WRITE_TIMEOUT_MS,
        }
    }
}

impl CacheConfig {
    pub fn user_info_ttl(&self) -> Duration {
        Duration::from_secs(self.user_info_ttl_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Backing store location. Without a data directory an in-memory backend is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: Option<PathBuf>,
}

/// Overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idgen: Option<IdGenOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdGenOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
