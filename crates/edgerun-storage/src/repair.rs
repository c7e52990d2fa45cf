//! Cache/metadata auto-repair.
//!
//! The content cache and the metadata index can desynchronize: a crash
//! between blob write and record write leaves cache-without-metadata; a
//! user clearing the cache directory leaves metadata-without-cache.
//! Before each use of a cached model the reconciler runs one of four
//! actions:
//!
//! | cache | metadata | action |
//! |-------|----------|--------|
//! | yes   | yes      | none |
//! | no    | no       | none |
//! | yes   | no       | purge cache entry (treated as corrupt) |
//! | no    | yes      | delete metadata (orphan record) |
//!
//! After a successful pass, cache and metadata are either both present or
//! both absent for the model.

use edgerun_kernel::diagnostics::RepairOutcome;
use tracing::{debug, warn};

use crate::cache::ContentCache;
use crate::error::StorageResult;
use crate::metadata::MetadataIndex;

/// Reconcile one model. Never fails the caller for a repairable
/// condition; IO failures during the purge surface as `Failed`.
pub fn auto_repair(
    cache: &ContentCache,
    index: &MetadataIndex,
    model_id: &str,
) -> RepairOutcome {
    let cache_hit = cache.has_model(model_id);
    let metadata_hit = index.contains(model_id);

    match (cache_hit, metadata_hit) {
        (true, true) | (false, false) => {
            debug!(model_id, cache_hit, "cache and metadata in sync");
            RepairOutcome::NotNeeded
        }
        (true, false) => {
            warn!(model_id, "cache entry without metadata, purging as corrupt");
            match cache.purge(model_id) {
                Ok(()) => RepairOutcome::Repaired,
                Err(e) => {
                    warn!(model_id, error = %e, "purge of desynchronized cache failed");
                    RepairOutcome::Failed
                }
            }
        }
        (false, true) => {
            warn!(model_id, "orphan metadata record, deleting");
            match index.delete(model_id) {
                Ok(_) => RepairOutcome::Repaired,
                Err(e) => {
                    warn!(model_id, error = %e, "orphan metadata delete failed");
                    RepairOutcome::Failed
                }
            }
        }
    }
}

/// Reconcile every model either side knows about. Returns the ids that
/// needed repair.
pub fn repair_all(cache: &ContentCache, index: &MetadataIndex) -> StorageResult<Vec<String>> {
    let mut ids: Vec<String> = index.list().into_iter().map(|r| r.id).collect();
    for sanitized in cache.list_models()? {
        if !ids.iter().any(|id| crate::cache::sanitize_model_id(id) == sanitized) {
            ids.push(sanitized);
        }
    }

    let mut repaired = Vec::new();
    for id in ids {
        if auto_repair(cache, index, &id) == RepairOutcome::Repaired {
            repaired.push(id);
        }
    }
    Ok(repaired)
}
