//! Device fingerprint and capability records.
//!
//! These are value types only; the probe that fills them lives in the
//! runtime crate so the kernel stays free of platform calls.

use serde::{Deserialize, Serialize};

/// Stable description of the host device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFingerprint {
    pub user_agent: String,
    pub platform: String,
    pub language: String,
    pub hardware_concurrency: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_memory_gb: Option<f64>,
    pub is_secure_context: bool,
    pub cross_origin_isolated: bool,
}

/// Feature availability on the host.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub has_window_ai: bool,
    pub has_web_gpu: bool,
    pub has_web_nn: bool,
    pub has_storage_estimate: bool,
    pub has_cache_storage: bool,
    pub has_indexed_db: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_serializes_camel_case() {
        let fp = DeviceFingerprint {
            user_agent: "edgerun/0.1.0 (linux)".into(),
            platform: "linux-x86_64".into(),
            language: "en-US".into(),
            hardware_concurrency: 8,
            device_memory_gb: Some(16.0),
            is_secure_context: true,
            cross_origin_isolated: false,
        };
        let json = serde_json::to_value(&fp).unwrap();
        assert_eq!(json["hardwareConcurrency"], 8);
        assert_eq!(json["deviceMemoryGb"], 16.0);
        assert_eq!(json["isSecureContext"], true);
    }

    #[test]
    fn capabilities_default_to_false() {
        let caps = Capabilities::default();
        assert!(!caps.has_web_gpu);
        assert!(!caps.has_window_ai);
    }
}
