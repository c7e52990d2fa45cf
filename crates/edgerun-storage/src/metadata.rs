//! Metadata index for downloaded models.
//!
//! One keyed record per model id in a single versioned store file. The
//! index is the authoritative "this model is present on disk" record;
//! the content cache holds bytes only. Records load into memory at open
//! and persist atomically (write-then-rename) on every mutation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StorageResult;

/// Store-file name. The `v1` suffix is the schema version; bump it on an
/// incompatible record change so stale stores are simply ignored.
pub const METADATA_STORE_FILE: &str = "model_index_v1.json";

/// Logical database name, used as the parent directory of the store.
pub const METADATA_DB_NAME: &str = "edgerun-models";

/// One model's persisted metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: String,
    pub size_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    pub last_accessed_at_ms: u64,
}

impl ModelRecord {
    pub fn new(id: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            size_bytes,
            downloaded_at: Utc::now(),
            checksum: None,
            engine_version: None,
            last_accessed_at_ms: edgerun_kernel::now_epoch_ms(),
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_engine_version(mut self, version: impl Into<String>) -> Self {
        self.engine_version = Some(version.into());
        self
    }
}

/// Keyed record store for model metadata.
pub struct MetadataIndex {
    path: PathBuf,
    records: RwLock<HashMap<String, ModelRecord>>,
}

impl MetadataIndex {
    /// Open the index under `root`, creating the store on first use.
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = root.as_ref().join(METADATA_DB_NAME);
        fs::create_dir_all(&dir)?;
        let path = dir.join(METADATA_STORE_FILE);

        let records = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(raw) => match serde_json::from_str::<HashMap<String, ModelRecord>>(&raw) {
                    Ok(map) => map,
                    Err(e) => {
                        // An unreadable store is treated as empty; the
                        // auto-repair pass will purge any orphaned cache.
                        warn!(path = %path.display(), error = %e, "metadata store unreadable, starting empty");
                        HashMap::new()
                    }
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "metadata store unreadable, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        info!(path = %path.display(), records = records.len(), "metadata index opened");
        Ok(Self { path, records: RwLock::new(records) })
    }

    pub fn get(&self, model_id: &str) -> Option<ModelRecord> {
        self.records.read().get(model_id).cloned()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.records.read().contains_key(model_id)
    }

    pub fn put(&self, record: ModelRecord) -> StorageResult<()> {
        {
            let mut records = self.records.write();
            debug!(model_id = %record.id, size_bytes = record.size_bytes, "metadata record upserted");
            records.insert(record.id.clone(), record);
        }
        self.persist()
    }

    pub fn delete(&self, model_id: &str) -> StorageResult<bool> {
        let removed = self.records.write().remove(model_id).is_some();
        if removed {
            debug!(model_id, "metadata record deleted");
            self.persist()?;
        }
        Ok(removed)
    }

    /// All records, unordered.
    pub fn list(&self) -> Vec<ModelRecord> {
        self.records.read().values().cloned().collect()
    }

    /// Update a record's last-accessed stamp.
    pub fn touch(&self, model_id: &str) -> StorageResult<bool> {
        let touched = {
            let mut records = self.records.write();
            match records.get_mut(model_id) {
                Some(record) => {
                    record.last_accessed_at_ms = edgerun_kernel::now_epoch_ms();
                    true
                }
                None => false,
            }
        };
        if touched {
            self.persist()?;
        }
        Ok(touched)
    }

    /// Sum of recorded sizes.
    pub fn total_size_bytes(&self) -> u64 {
        self.records.read().values().map(|r| r.size_bytes).sum()
    }

    fn persist(&self) -> StorageResult<()> {
        let serialized = {
            let records = self.records.read();
            serde_json::to_string_pretty(&*records)?
        };
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
