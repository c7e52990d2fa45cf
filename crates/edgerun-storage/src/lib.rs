//! Edgerun storage: the model store under the orchestration kernel.
//!
//! - [`cache`] — content cache, one blob namespace per model id
//! - [`metadata`] — the authoritative keyed record store
//! - [`repair`] — cache/metadata reconciliation
//! - [`quota`] — storage estimation and the download safety margin
//! - [`shard`] — optional sharded-artifact layout
//! - [`lru`] — the composed eviction policy

pub mod cache;
pub mod error;
pub mod lru;
pub mod metadata;
pub mod quota;
pub mod repair;
pub mod shard;

pub use cache::{ContentCache, DEFAULT_CACHE_PREFIX, sanitize_model_id};
pub use error::{StorageError, StorageResult};
pub use lru::{DEFAULT_MAX_USAGE_RATIO, DEFAULT_MIN_FREE_BYTES, LruCacheManager};
pub use metadata::{METADATA_DB_NAME, METADATA_STORE_FILE, MetadataIndex, ModelRecord};
pub use quota::{
    DEFAULT_QUOTA_SAFETY_MARGIN, DiskQuotaEstimator, FixedQuotaEstimator, QuotaEstimator,
    StorageEstimate, required_bytes,
};
pub use repair::{auto_repair, repair_all};
pub use shard::ShardStore;
