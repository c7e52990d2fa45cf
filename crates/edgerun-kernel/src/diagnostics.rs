//! Aggregated diagnostics snapshot.
//!
//! One stable JSON document (`schemaVersion: "1"`) answering "what is the
//! runtime doing and why" without the host having observed any individual
//! event: current state, selection and preflight provenance, environment,
//! storage, cache health, timings, SLO targets, and the last ten errors.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::PrivacyMode;
use crate::env::{Capabilities, DeviceFingerprint};
use crate::error::RuntimeError;
use crate::provider::RuntimeMode;
use crate::selection::{QuotaPreflightReport, SelectionReport};
use crate::state::StateSnapshot;

pub const DIAGNOSTICS_SCHEMA_VERSION: &str = "1";

/// How many recent errors the ring retains.
pub const RECENT_ERROR_CAPACITY: usize = 10;

/// Outcome of a cache/metadata reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairOutcome {
    /// One desynchronized side was purged; cache and metadata converged.
    Repaired,
    NotNeeded,
    Failed,
}

/// Privacy posture as actually running.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyDiag {
    pub privacy_mode: PrivacyMode,
    pub runtime_mode: RuntimeMode,
    pub note: String,
}

/// Storage estimator view.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDiag {
    pub supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_bytes: Option<u64>,
}

/// Cache health for the active model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDiag {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_auto_repair_result: Option<RepairOutcome>,
}

/// Observed lifecycle timings.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_token_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_per_second: Option<f64>,
    pub last_state_change_at_ms: u64,
}

/// Service-level targets plus last observed values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SloDiag {
    pub feedback_ui_p95_target_ms: u64,
    pub abort_ui_p95_target_ms: u64,
    pub booting_p95_target_ms: u64,
    pub worker_chunk_gzip_max_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observed_boot_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observed_abort_ms: Option<u64>,
}

impl Default for SloDiag {
    fn default() -> Self {
        Self {
            feedback_ui_p95_target_ms: 200,
            abort_ui_p95_target_ms: 500,
            booting_p95_target_ms: 2_000,
            worker_chunk_gzip_max_bytes: 10 * 1024 * 1024,
            last_observed_boot_ms: None,
            last_observed_abort_ms: None,
        }
    }
}

/// Where the system prompt ends up for the active provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemPromptLocation {
    /// Delivered as a dedicated system-role message.
    System,
    /// Flattened into the first user message for providers without a
    /// system role.
    InlinedFirstUser,
}

/// Message-shaping behavior of the active adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterDiag {
    pub message_flattened: bool,
    pub system_prompt_location: SystemPromptLocation,
}

impl Default for AdapterDiag {
    fn default() -> Self {
        Self {
            message_flattened: false,
            system_prompt_location: SystemPromptLocation::System,
        }
    }
}

/// The full snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub schema_version: String,
    pub generated_at_ms: u64,
    pub lib_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_report: Option<SelectionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_preflight_report: Option<QuotaPreflightReport>,
    pub state: StateSnapshot,
    pub privacy: PrivacyDiag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<DeviceFingerprint>,
    pub capabilities: Capabilities,
    pub storage: StorageDiag,
    pub cache: CacheDiag,
    pub timings: Timings,
    pub slo: SloDiag,
    pub adapters: AdapterDiag,
    pub recent_errors: Vec<RuntimeError>,
}

/// Fixed-capacity ring of the most recent errors, newest last.
#[derive(Debug, Default)]
pub struct ErrorRing {
    entries: VecDeque<RuntimeError>,
}

impl ErrorRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: RuntimeError) {
        if self.entries.len() == RECENT_ERROR_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(error);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn to_vec(&self) -> Vec<RuntimeError> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn ring_caps_at_ten() {
        let mut ring = ErrorRing::new();
        for i in 0..15 {
            ring.push(RuntimeError::new(ErrorCode::Unknown, format!("e{i}")));
        }
        assert_eq!(ring.len(), RECENT_ERROR_CAPACITY);
        let entries = ring.to_vec();
        assert_eq!(entries.first().unwrap().message, "e5");
        assert_eq!(entries.last().unwrap().message, "e14");
    }

    #[test]
    fn slo_defaults() {
        let slo = SloDiag::default();
        assert_eq!(slo.feedback_ui_p95_target_ms, 200);
        assert_eq!(slo.abort_ui_p95_target_ms, 500);
        assert_eq!(slo.booting_p95_target_ms, 2_000);
        assert_eq!(slo.worker_chunk_gzip_max_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn repair_outcome_wire_format() {
        assert_eq!(
            serde_json::to_string(&RepairOutcome::NotNeeded).unwrap(),
            "\"not-needed\""
        );
    }

    #[test]
    fn snapshot_serializes_schema_version() {
        let snapshot = DiagnosticsSnapshot {
            schema_version: DIAGNOSTICS_SCHEMA_VERSION.into(),
            generated_at_ms: 1,
            lib_version: "0.1.0".into(),
            selection_report: None,
            quota_preflight_report: None,
            state: StateSnapshot {
                state: crate::state::RuntimeState::Idle,
                since_ms: 0,
                deadline_ms: None,
                deadline_at_ms: None,
                provider_id: None,
                selection_report_id: None,
            },
            privacy: PrivacyDiag {
                privacy_mode: PrivacyMode::Any,
                runtime_mode: RuntimeMode::FullyLocalManaged,
                note: "".into(),
            },
            env: None,
            capabilities: Capabilities::default(),
            storage: StorageDiag::default(),
            cache: CacheDiag::default(),
            timings: Timings::default(),
            slo: SloDiag::default(),
            adapters: AdapterDiag::default(),
            recent_errors: vec![],
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["schemaVersion"], "1");
        assert_eq!(json["state"]["tag"], "IDLE");
        assert_eq!(json["slo"]["feedbackUiP95TargetMs"], 200);
    }
}
