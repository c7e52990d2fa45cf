//! Storage quota estimation.
//!
//! The estimator answers `{quota, usage, available}` for the volume the
//! model store lives on. Platforms without a usable probe report
//! `supported = false`; callers then skip quota gating rather than
//! rejecting incorrectly, the same posture the memory preflight takes on
//! hosts that cannot report available RAM.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tracing::debug;

use crate::error::StorageResult;

/// Safety margin applied on top of a model's nominal size before the
/// download is admitted.
pub const DEFAULT_QUOTA_SAFETY_MARGIN: f64 = 0.05;

/// Bytes required to admit a download of `size_bytes`, margin included.
pub fn required_bytes(size_bytes: u64, margin: f64) -> u64 {
    (size_bytes as f64 * (1.0 + margin)).ceil() as u64
}

/// One storage estimate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageEstimate {
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_bytes: Option<u64>,
}

impl StorageEstimate {
    pub fn unsupported() -> Self {
        Self::default()
    }

    pub fn new(quota_bytes: u64, usage_bytes: u64) -> Self {
        Self {
            supported: true,
            quota_bytes: Some(quota_bytes),
            usage_bytes: Some(usage_bytes),
        }
    }

    /// `quota − usage`, when both sides are known.
    pub fn available_bytes(&self) -> Option<u64> {
        match (self.quota_bytes, self.usage_bytes) {
            (Some(quota), Some(usage)) => Some(quota.saturating_sub(usage)),
            _ => None,
        }
    }
}

/// Estimator seam; disk-backed in production, fixed in tests.
#[async_trait]
pub trait QuotaEstimator: Send + Sync {
    async fn estimate(&self) -> StorageResult<StorageEstimate>;
}

/// Estimates from the disk that holds the model store.
pub struct DiskQuotaEstimator {
    root: PathBuf,
}

impl DiskQuotaEstimator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn probe(&self) -> StorageEstimate {
        let disks = Disks::new_with_refreshed_list();
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());

        // Longest mount-point prefix wins; '/' matches everything.
        let best = disks
            .list()
            .iter()
            .filter(|d| root.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len());

        match best {
            Some(disk) => {
                let quota = disk.total_space();
                let usage = quota.saturating_sub(disk.available_space());
                debug!(
                    mount = %disk.mount_point().display(),
                    quota,
                    usage,
                    "disk quota probed"
                );
                StorageEstimate::new(quota, usage)
            }
            None => StorageEstimate::unsupported(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl QuotaEstimator for DiskQuotaEstimator {
    async fn estimate(&self) -> StorageResult<StorageEstimate> {
        Ok(self.probe())
    }
}

/// Deterministic estimator for tests and hermetic hosts.
pub struct FixedQuotaEstimator {
    estimate: StorageEstimate,
}

impl FixedQuotaEstimator {
    pub fn new(quota_bytes: u64, usage_bytes: u64) -> Self {
        Self { estimate: StorageEstimate::new(quota_bytes, usage_bytes) }
    }

    pub fn unsupported() -> Self {
        Self { estimate: StorageEstimate::unsupported() }
    }
}

#[async_trait]
impl QuotaEstimator for FixedQuotaEstimator {
    async fn estimate(&self) -> StorageResult<StorageEstimate> {
        Ok(self.estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_bytes_applies_margin() {
        assert_eq!(required_bytes(1000, 0.05), 1050);
        assert_eq!(required_bytes(0, 0.05), 0);
        // Ceil, never floor: a one-byte model still reserves its margin.
        assert_eq!(required_bytes(1, 0.05), 2);
    }

    #[test]
    fn available_is_quota_minus_usage() {
        let est = StorageEstimate::new(1000, 400);
        assert_eq!(est.available_bytes(), Some(600));

        let unsupported = StorageEstimate::unsupported();
        assert!(!unsupported.supported);
        assert_eq!(unsupported.available_bytes(), None);
    }

    #[test]
    fn available_saturates_at_zero() {
        let est = StorageEstimate::new(100, 400);
        assert_eq!(est.available_bytes(), Some(0));
    }

    #[tokio::test]
    async fn fixed_estimator_returns_configured_values() {
        let est = FixedQuotaEstimator::new(2_000, 500).estimate().await.unwrap();
        assert!(est.supported);
        assert_eq!(est.available_bytes(), Some(1_500));
    }

    #[tokio::test]
    async fn disk_estimator_probes_without_error() {
        let est = DiskQuotaEstimator::new(std::env::temp_dir())
            .estimate()
            .await
            .unwrap();
        // Either a real mount was found or the platform reports
        // unsupported; both are valid outcomes.
        if est.supported {
            assert!(est.quota_bytes.unwrap() > 0);
        }
    }
}
