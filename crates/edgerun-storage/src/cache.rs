//! Content cache for downloaded model blobs.
//!
//! One namespace directory per model id (`<prefix>-<sanitized id>/`),
//! entries inside keyed by blob name. The cache stores bytes only; the
//! metadata index is the authoritative record of "this model is present".

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};

/// Default namespace prefix.
pub const DEFAULT_CACHE_PREFIX: &str = "edgerun-model";

/// Replace path-hostile characters so a model id becomes one directory
/// component. Mirrors the reverse mapping in [`ContentCache::list_models`];
/// ids containing literal `-` therefore round-trip through the metadata
/// index, not through directory names.
pub fn sanitize_model_id(model_id: &str) -> String {
    model_id.replace(['/', '\\', ':'], "-")
}

/// Filesystem-backed blob store partitioned per model.
pub struct ContentCache {
    root: PathBuf,
    prefix: String,
}

impl ContentCache {
    /// Open (and create) a cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        Self::with_prefix(root, DEFAULT_CACHE_PREFIX)
    }

    pub fn with_prefix(root: impl Into<PathBuf>, prefix: impl Into<String>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let prefix = prefix.into();
        info!(root = %root.display(), prefix = %prefix, "content cache opened");
        Ok(Self { root, prefix })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Namespace directory for one model.
    pub fn namespace_dir(&self, model_id: &str) -> PathBuf {
        self.root
            .join(format!("{}-{}", self.prefix, sanitize_model_id(model_id)))
    }

    fn entry_path(&self, model_id: &str, key: &str) -> PathBuf {
        self.namespace_dir(model_id).join(sanitize_model_id(key))
    }

    /// True when the model has at least one cached blob.
    pub fn has_model(&self, model_id: &str) -> bool {
        let dir = self.namespace_dir(model_id);
        fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false)
    }

    /// Store one blob under `key`, creating the namespace on first write.
    pub fn insert(&self, model_id: &str, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let dir = self.namespace_dir(model_id);
        fs::create_dir_all(&dir)?;
        let path = self.entry_path(model_id, key);
        fs::write(&path, bytes)?;
        debug!(model_id, key, len = bytes.len(), "cache entry written");
        Ok(())
    }

    /// Read one blob back.
    pub fn read(&self, model_id: &str, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.entry_path(model_id, key);
        if !path.exists() {
            return Err(StorageError::NotFound(format!("{model_id}/{key}")));
        }
        Ok(fs::read(&path)?)
    }

    /// List blob keys for one model.
    pub fn list_entries(&self, model_id: &str) -> StorageResult<Vec<String>> {
        let dir = self.namespace_dir(model_id);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut keys = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                keys.push(name.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// List sanitized model ids with at least one cached blob.
    pub fn list_models(&self) -> StorageResult<Vec<String>> {
        let mut models = Vec::new();
        let marker = format!("{}-", self.prefix);
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stripped) = name.strip_prefix(&marker) {
                    models.push(stripped.to_string());
                }
            }
        }
        models.sort();
        Ok(models)
    }

    /// Total bytes cached for one model.
    pub fn usage_bytes(&self, model_id: &str) -> StorageResult<u64> {
        let dir = self.namespace_dir(model_id);
        if !dir.exists() {
            return Ok(0);
        }
        let mut total = 0;
        for entry in fs::read_dir(&dir)? {
            total += entry?.metadata()?.len();
        }
        Ok(total)
    }

    /// Total bytes across every namespace.
    pub fn total_usage_bytes(&self) -> StorageResult<u64> {
        let mut total = 0;
        for model in self.list_models()? {
            // list_models returns sanitized ids; sanitize is idempotent so
            // usage_bytes resolves the same directory.
            total += self.usage_bytes(&model)?;
        }
        Ok(total)
    }

    /// Delete the whole namespace for one model.
    pub fn purge(&self, model_id: &str) -> StorageResult<()> {
        let dir = self.namespace_dir(model_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            info!(model_id, "cache namespace purged");
        }
        Ok(())
    }

    /// SHA-256 digest of one cached blob, hex-encoded. Used to verify the
    /// integrity recorded in the metadata index.
    pub fn checksum(&self, model_id: &str, key: &str) -> StorageResult<String> {
        let bytes = self.read(model_id, key)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}
