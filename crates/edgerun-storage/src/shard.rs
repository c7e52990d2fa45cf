//! Shard store for large model artifacts.
//!
//! Layout: `<root>/models/<sanitized id>/metadata.json` plus
//! `shard_<i>.bin` files. `metadata.json` is UTF-8 JSON conforming to the
//! metadata record, so a shard directory is self-describing even without
//! the index. The store is optional; the LRU manager composes it when the
//! host provides a root.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::cache::sanitize_model_id;
use crate::error::{StorageError, StorageResult};
use crate::metadata::ModelRecord;

const MODELS_DIR: &str = "models";
const SHARD_METADATA_FILE: &str = "metadata.json";

/// Directory-per-model shard layout.
pub struct ShardStore {
    root: PathBuf,
}

impl ShardStore {
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(MODELS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.root.join(MODELS_DIR).join(sanitize_model_id(model_id))
    }

    fn shard_path(&self, model_id: &str, index: usize) -> PathBuf {
        self.model_dir(model_id).join(format!("shard_{index}.bin"))
    }

    /// Write shards in order plus the metadata sidecar.
    pub fn write_model<'a>(
        &self,
        record: &ModelRecord,
        shards: impl IntoIterator<Item = &'a [u8]>,
    ) -> StorageResult<usize> {
        let dir = self.model_dir(&record.id);
        fs::create_dir_all(&dir)?;

        let mut count = 0;
        for (i, shard) in shards.into_iter().enumerate() {
            fs::write(self.shard_path(&record.id, i), shard)?;
            count = i + 1;
        }

        let sidecar = serde_json::to_string_pretty(record)?;
        fs::write(dir.join(SHARD_METADATA_FILE), sidecar)?;

        info!(model_id = %record.id, shards = count, "shard model written");
        Ok(count)
    }

    /// Read one shard back.
    pub fn read_shard(&self, model_id: &str, index: usize) -> StorageResult<Vec<u8>> {
        let path = self.shard_path(model_id, index);
        if !path.exists() {
            return Err(StorageError::NotFound(format!("{model_id}/shard_{index}")));
        }
        Ok(fs::read(path)?)
    }

    /// The metadata sidecar, parsed.
    pub fn read_metadata(&self, model_id: &str) -> StorageResult<ModelRecord> {
        let path = self.model_dir(model_id).join(SHARD_METADATA_FILE);
        if !path.exists() {
            return Err(StorageError::NotFound(model_id.to_string()));
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| StorageError::CorruptEntry {
            model_id: model_id.to_string(),
            detail: format!("invalid metadata.json: {e}"),
        })
    }

    pub fn has_model(&self, model_id: &str) -> bool {
        self.model_dir(model_id).join(SHARD_METADATA_FILE).exists()
    }

    pub fn shard_count(&self, model_id: &str) -> StorageResult<usize> {
        let dir = self.model_dir(model_id);
        if !dir.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with("shard_") && name.ends_with(".bin") {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn usage_bytes(&self, model_id: &str) -> StorageResult<u64> {
        let dir = self.model_dir(model_id);
        if !dir.exists() {
            return Ok(0);
        }
        let mut total = 0;
        for entry in fs::read_dir(&dir)? {
            total += entry?.metadata()?.len();
        }
        Ok(total)
    }

    pub fn remove_model(&self, model_id: &str) -> StorageResult<()> {
        let dir = self.model_dir(model_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!(model_id, "shard model removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ShardStore) {
        let dir = TempDir::new().unwrap();
        let store = ShardStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn write_and_read_shards() {
        let (_dir, store) = store();
        let record = ModelRecord::new("org/model", 5);
        let count = store
            .write_model(&record, [b"abc".as_slice(), b"de".as_slice()])
            .unwrap();
        assert_eq!(count, 2);

        assert_eq!(store.read_shard("org/model", 0).unwrap(), b"abc");
        assert_eq!(store.read_shard("org/model", 1).unwrap(), b"de");
        assert_eq!(store.shard_count("org/model").unwrap(), 2);
        assert!(store.has_model("org/model"));
    }

    #[test]
    fn metadata_sidecar_roundtrips() {
        let (_dir, store) = store();
        let record = ModelRecord::new("m", 42).with_engine_version("1.2.3");
        store.write_model(&record, [b"x".as_slice()]).unwrap();

        let back = store.read_metadata("m").unwrap();
        assert_eq!(back.id, "m");
        assert_eq!(back.size_bytes, 42);
        assert_eq!(back.engine_version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn layout_matches_contract() {
        let (_dir, store) = store();
        let record = ModelRecord::new("org/model", 1);
        store.write_model(&record, [b"x".as_slice()]).unwrap();

        let dir = store.model_dir("org/model");
        assert!(dir.ends_with("models/org-model"));
        assert!(dir.join("metadata.json").exists());
        assert!(dir.join("shard_0.bin").exists());
    }

    #[test]
    fn remove_clears_directory() {
        let (_dir, store) = store();
        store
            .write_model(&ModelRecord::new("m", 1), [b"x".as_slice()])
            .unwrap();
        store.remove_model("m").unwrap();
        assert!(!store.has_model("m"));
        assert_eq!(store.usage_bytes("m").unwrap(), 0);
    }

    #[test]
    fn missing_shard_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.read_shard("ghost", 0),
            Err(StorageError::NotFound(_))
        ));
    }
}
