//! Storage-layer error types.

use edgerun_kernel::error::{ErrorCode, RuntimeError};
use thiserror::Error;

/// Typed errors for cache, metadata, shard, and quota operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt entry for model '{model_id}': {detail}")]
    CorruptEntry { model_id: String, detail: String },

    #[error("No cached entry for model '{0}'")]
    NotFound(String),

    #[error("Storage estimate unavailable: {0}")]
    EstimateUnavailable(String),

    #[error("Insufficient space: need {required_bytes} bytes, {available_bytes} available")]
    InsufficientSpace {
        required_bytes: u64,
        available_bytes: u64,
    },
}

/// Convenience result alias for this crate.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for RuntimeError {
    fn from(err: StorageError) -> Self {
        let code = match &err {
            StorageError::CorruptEntry { .. } => ErrorCode::CacheCorrupt,
            StorageError::NotFound(_) => ErrorCode::CacheCorrupt,
            StorageError::InsufficientSpace { .. } => ErrorCode::QuotaExceeded,
            StorageError::EstimateUnavailable(_) => ErrorCode::QuotaPreflightFail,
            StorageError::Io(_) | StorageError::Serialization(_) => ErrorCode::Unknown,
        };
        RuntimeError::new(code, err.to_string()).with_cause(format!("{err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_entry_maps_to_cache_corrupt() {
        let err: RuntimeError = StorageError::CorruptEntry {
            model_id: "m".into(),
            detail: "size mismatch".into(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::CacheCorrupt);
        assert!(err.message.contains("size mismatch"));
    }

    #[test]
    fn insufficient_space_maps_to_quota_exceeded() {
        let err: RuntimeError = StorageError::InsufficientSpace {
            required_bytes: 100,
            available_bytes: 10,
        }
        .into();
        assert_eq!(err.code, ErrorCode::QuotaExceeded);
    }
}
