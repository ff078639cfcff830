//! # Forumshard
//!
//! Sharded identity resolution and cursor-paginated listing for a forum
//! backend: users, posts and replies spread over hash-routed physical tables,
//! a bounded time-ordered accelerator in front of the post lists, and a
//! globally ordered id generator underneath both.

pub mod cache;
pub mod config;
pub mod cursor;
pub mod error;
pub mod idgen;
pub mod model;
pub mod paginate;
pub mod pool;
pub mod service;
pub mod shard;
pub mod storage;
pub mod tos;

// Re-export main types for convenience
pub use config::{ConfigError, ConfigOverrides, ForumConfig};
pub use cursor::PageCursor;
pub use error::{ForumError, ForumResult};
pub use idgen::{IdGenerator, NodeRegistry};
pub use model::{EntityId, Millis, NaturalKeyKind, Post, PostOrder, Reply, User};
pub use paginate::{Page, PageSource, PostDetail, PostPaginator, ReplyDetail};
pub use service::{Forum, Registration, UserBasic};
pub use shard::{route_id, route_key, ShardCount, ShardedTable};
pub use storage::{MemoryBackend, RocksBackend, TableBackend};
pub use tos::{Accelerator, EvictionPolicy, MemoryTos};
