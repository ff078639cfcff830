//! Default constants for forumshard configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// ID Generation Defaults
// =============================================================================

/// Instant considered "time zero" for generated ids (UTC date).
pub const DEFAULT_ID_EPOCH: &str = "2023-01-01";

/// Node discriminator embedded in generated ids.
pub const DEFAULT_ID_NODE: u16 = 0;

// =============================================================================
// Sharding Defaults
// =============================================================================

/// Physical partitions of the primary user table.
pub const DEFAULT_USER_SHARDS: u32 = 4;

/// Physical partitions of the email -> user id index.
pub const DEFAULT_USER_EMAIL_SHARDS: u32 = 4;

/// Physical partitions of the phone -> user id index.
/// Phones are looked up less often than emails, so fewer tables suffice.
pub const DEFAULT_USER_PHONE_SHARDS: u32 = 2;

/// Physical partitions of the nickname -> user id index.
pub const DEFAULT_USER_NICKNAME_SHARDS: u32 = 4;

/// Physical partitions of the post table.
pub const DEFAULT_POST_SHARDS: u32 = 2;

/// Physical partitions of the reply table.
pub const DEFAULT_REPLY_SHARDS: u32 = 2;

// =============================================================================
// Pagination Defaults
// =============================================================================

/// Page size used when a caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Hard upper bound for a single page.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;

// =============================================================================
// Accelerator Defaults
// =============================================================================

/// Most recent posts kept per post list ordering.
pub const DEFAULT_POST_LIST_CACHE_SIZE: usize = 1000;

/// Budget for a single accelerator lookup before falling back (milliseconds).
pub const DEFAULT_ACCELERATOR_TIMEOUT_MS: u64 = 50;

/// Largest range a single accelerator fetch may request.
pub const MAX_ACCELERATOR_FETCH: usize = 1000;

// =============================================================================
// Worker Defaults
// =============================================================================

/// Workers used by a single batch fetch.
pub const DEFAULT_BATCH_FETCH_WORKERS: usize = 4;

// =============================================================================
// Cache Defaults
// =============================================================================

/// Entries held by the in-process key/value cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// Lifetime of cached user info and natural-key lookups (seconds).
pub const DEFAULT_USER_INFO_TTL_SECS: u64 = 3600;

/// Relative jitter applied to cache lifetimes to spread expiry.
pub const DEFAULT_TTL_JITTER: f64 = 0.1;

/// Budget for detached best-effort cache writes (milliseconds).
pub const DEFAULT_CACHE_WRITE_TIMEOUT_MS: u64 = 500;

// =============================================================================
// Validation Limits
// =============================================================================

/// Longest accepted nickname, in characters.
pub const MAX_NICKNAME_CHARS: usize = 32;

/// Longest accepted post title, in characters.
pub const MAX_TITLE_CHARS: usize = 128;

/// Longest accepted post or reply body, in characters.
pub const MAX_CONTENT_CHARS: usize = 10_000;
