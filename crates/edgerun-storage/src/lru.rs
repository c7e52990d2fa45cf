//! LRU cache manager.
//!
//! Aggregates the content cache, the metadata index, and the optional
//! shard store into one eviction policy. Eviction order is strictly by
//! `last_accessed_at_ms` ascending; models pinned by an external holder
//! are never candidates.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::cache::ContentCache;
use crate::error::{StorageError, StorageResult};
use crate::metadata::{MetadataIndex, ModelRecord};
use crate::quota::QuotaEstimator;
use crate::shard::ShardStore;

/// Evict down to this fraction of quota on `auto_evict`.
pub const DEFAULT_MAX_USAGE_RATIO: f64 = 0.8;

/// Keep at least this much free after `evict_for_space`.
pub const DEFAULT_MIN_FREE_BYTES: u64 = 500 * 1024 * 1024;

/// Composition of cache + metadata + optional shards under one policy.
pub struct LruCacheManager {
    cache: ContentCache,
    index: MetadataIndex,
    shards: Option<ShardStore>,
    estimator: Arc<dyn QuotaEstimator>,
    max_usage_ratio: f64,
    min_free_bytes: u64,
    /// Models an external consumer is actively holding; excluded from
    /// every eviction pass.
    pinned: RwLock<HashSet<String>>,
}

impl LruCacheManager {
    pub fn new(
        cache: ContentCache,
        index: MetadataIndex,
        estimator: Arc<dyn QuotaEstimator>,
    ) -> Self {
        Self {
            cache,
            index,
            shards: None,
            estimator,
            max_usage_ratio: DEFAULT_MAX_USAGE_RATIO,
            min_free_bytes: DEFAULT_MIN_FREE_BYTES,
            pinned: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_shard_store(mut self, shards: ShardStore) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn with_max_usage_ratio(mut self, ratio: f64) -> Self {
        self.max_usage_ratio = ratio;
        self
    }

    pub fn with_min_free_bytes(mut self, bytes: u64) -> Self {
        self.min_free_bytes = bytes;
        self
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn index(&self) -> &MetadataIndex {
        &self.index
    }

    pub fn shards(&self) -> Option<&ShardStore> {
        self.shards.as_ref()
    }

    pub fn estimator(&self) -> &Arc<dyn QuotaEstimator> {
        &self.estimator
    }

    /// Known models, least-recently-accessed first.
    pub fn get_models(&self) -> Vec<ModelRecord> {
        let mut records = self.index.list();
        records.sort_by_key(|r| r.last_accessed_at_ms);
        records
    }

    /// Mark a model as just used.
    pub fn touch_model(&self, model_id: &str) -> StorageResult<bool> {
        self.index.touch(model_id)
    }

    /// Pin a model against eviction while an external holder uses it.
    pub fn pin_model(&self, model_id: &str) {
        self.pinned.write().insert(model_id.to_string());
    }

    pub fn unpin_model(&self, model_id: &str) {
        self.pinned.write().remove(model_id);
    }

    fn is_pinned(&self, model_id: &str) -> bool {
        self.pinned.read().contains(model_id)
    }

    /// Remove one model from every composed store.
    pub fn evict_model(&self, model_id: &str) -> StorageResult<u64> {
        let freed = self
            .index
            .get(model_id)
            .map(|r| r.size_bytes)
            .unwrap_or_default();
        self.cache.purge(model_id)?;
        self.index.delete(model_id)?;
        if let Some(shards) = &self.shards {
            shards.remove_model(model_id)?;
        }
        info!(model_id, freed_bytes = freed, "model evicted");
        Ok(freed)
    }

    /// Evict oldest entries until `usage ≤ max_usage_ratio × quota`.
    ///
    /// Returns the evicted ids, oldest first. A host without a usable
    /// estimate never evicts here.
    pub async fn auto_evict(&self) -> StorageResult<Vec<String>> {
        let estimate = self.estimator.estimate().await?;
        let (Some(quota), Some(mut usage)) = (estimate.quota_bytes, estimate.usage_bytes) else {
            return Ok(vec![]);
        };
        let ceiling = (quota as f64 * self.max_usage_ratio) as u64;

        let mut evicted = Vec::new();
        for record in self.get_models() {
            if usage <= ceiling {
                break;
            }
            if self.is_pinned(&record.id) {
                continue;
            }
            let freed = self.evict_model(&record.id)?;
            usage = usage.saturating_sub(freed);
            evicted.push(record.id);
        }

        if usage > ceiling {
            warn!(usage, ceiling, "auto-evict could not reach the usage ceiling");
        }
        Ok(evicted)
    }

    /// Evict until `available ≥ max(required_bytes, min_free_bytes)`.
    ///
    /// Fails with `InsufficientSpace` when even a fully-drained cache
    /// cannot satisfy the requirement.
    pub async fn evict_for_space(&self, required_bytes: u64) -> StorageResult<Vec<String>> {
        let estimate = self.estimator.estimate().await?;
        let Some(mut available) = estimate.available_bytes() else {
            // No estimate means no gating; the caller already decided to
            // proceed on unsupported platforms.
            return Ok(vec![]);
        };
        let target = required_bytes.max(self.min_free_bytes);

        let mut evicted = Vec::new();
        for record in self.get_models() {
            if available >= target {
                break;
            }
            if self.is_pinned(&record.id) {
                continue;
            }
            let freed = self.evict_model(&record.id)?;
            available += freed;
            evicted.push(record.id);
        }

        if available < target {
            return Err(StorageError::InsufficientSpace {
                required_bytes: target,
                available_bytes: available,
            });
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::FixedQuotaEstimator;
    use tempfile::TempDir;

    fn manager(quota: u64, usage: u64) -> (TempDir, LruCacheManager) {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::new(dir.path().join("cache")).unwrap();
        let index = MetadataIndex::open(dir.path()).unwrap();
        let estimator = Arc::new(FixedQuotaEstimator::new(quota, usage));
        let mgr = LruCacheManager::new(cache, index, estimator).with_min_free_bytes(0);
        (dir, mgr)
    }

    fn seed(mgr: &LruCacheManager, id: &str, size: u64, last_accessed: u64) {
        mgr.cache().insert(id, "weights.bin", &vec![0u8; 4]).unwrap();
        let mut record = ModelRecord::new(id, size);
        record.last_accessed_at_ms = last_accessed;
        mgr.index().put(record).unwrap();
    }

    #[test]
    fn models_sorted_by_last_accessed() {
        let (_dir, mgr) = manager(1000, 0);
        seed(&mgr, "new", 10, 300);
        seed(&mgr, "old", 10, 100);
        seed(&mgr, "mid", 10, 200);

        let ids: Vec<String> = mgr.get_models().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["old", "mid", "new"]);
    }

    #[tokio::test]
    async fn auto_evict_stops_at_ceiling() {
        // quota 1000, ratio 0.8 → ceiling 800; usage 950 must drop ≥ 150.
        let (_dir, mgr) = manager(1000, 950);
        seed(&mgr, "old", 100, 1);
        seed(&mgr, "mid", 100, 2);
        seed(&mgr, "new", 100, 3);

        let evicted = mgr.auto_evict().await.unwrap();
        assert_eq!(evicted, vec!["old", "mid"]);
        assert!(mgr.index().contains("new"));
    }

    #[tokio::test]
    async fn evict_for_space_frees_oldest_first() {
        // available = 1000 - 950 = 50; need 200 → evict 150 bytes' worth.
        let (_dir, mgr) = manager(1000, 950);
        seed(&mgr, "a", 100, 1);
        seed(&mgr, "b", 100, 2);

        let evicted = mgr.evict_for_space(200).await.unwrap();
        assert_eq!(evicted, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn evict_for_space_honors_min_free_floor() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::new(dir.path().join("cache")).unwrap();
        let index = MetadataIndex::open(dir.path()).unwrap();
        let estimator = Arc::new(FixedQuotaEstimator::new(1000, 500));
        let mgr = LruCacheManager::new(cache, index, estimator).with_min_free_bytes(600);
        seed(&mgr, "a", 200, 1);

        // available 500 < max(10, 600): the floor drives eviction.
        let evicted = mgr.evict_for_space(10).await.unwrap();
        assert_eq!(evicted, vec!["a"]);
    }

    #[tokio::test]
    async fn pinned_models_are_skipped() {
        let (_dir, mgr) = manager(1000, 950);
        seed(&mgr, "held", 500, 1);
        seed(&mgr, "loose", 500, 2);
        mgr.pin_model("held");

        let evicted = mgr.evict_for_space(400).await.unwrap();
        assert_eq!(evicted, vec!["loose"]);
        assert!(mgr.index().contains("held"));
    }

    #[tokio::test]
    async fn insufficient_space_is_an_error() {
        let (_dir, mgr) = manager(1000, 990);
        seed(&mgr, "small", 5, 1);

        let err = mgr.evict_for_space(800).await.unwrap_err();
        assert!(matches!(err, StorageError::InsufficientSpace { .. }));
    }

    #[tokio::test]
    async fn unsupported_estimate_never_evicts() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::new(dir.path().join("cache")).unwrap();
        let index = MetadataIndex::open(dir.path()).unwrap();
        let mgr = LruCacheManager::new(
            cache,
            index,
            Arc::new(FixedQuotaEstimator::unsupported()),
        );
        seed(&mgr, "a", 100, 1);

        assert!(mgr.auto_evict().await.unwrap().is_empty());
        assert!(mgr.evict_for_space(10_000).await.unwrap().is_empty());
        assert!(mgr.index().contains("a"));
    }

    #[test]
    fn evict_model_clears_every_store() {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::new(dir.path().join("cache")).unwrap();
        let index = MetadataIndex::open(dir.path()).unwrap();
        let shards = ShardStore::new(dir.path().join("shards")).unwrap();
        let mgr = LruCacheManager::new(
            cache,
            index,
            Arc::new(FixedQuotaEstimator::new(1000, 0)),
        )
        .with_shard_store(shards);

        seed(&mgr, "m", 50, 1);
        mgr.shards()
            .unwrap()
            .write_model(&ModelRecord::new("m", 50), [b"x".as_slice()])
            .unwrap();

        let freed = mgr.evict_model("m").unwrap();
        assert_eq!(freed, 50);
        assert!(!mgr.cache().has_model("m"));
        assert!(!mgr.index().contains("m"));
        assert!(!mgr.shards().unwrap().has_model("m"));
    }
}
