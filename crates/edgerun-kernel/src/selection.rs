//! Selection and preflight reports.
//!
//! Both reports are immutable once emitted. The selection report id is
//! attached to every subsequent generation result so a host application
//! can always trace which policy walk produced the active provider.

use serde::{Deserialize, Serialize};

use crate::now_epoch_ms;
use crate::provider::ProviderId;

/// Why a candidate provider was accepted or rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionReason {
    /// Accepted because it came first in the policy order and probed
    /// available.
    OrderPolicy,
    /// Skipped: privacy mode excludes delegated providers.
    PrivacyMode,
    /// Skipped: no adapter registered for this id.
    Unsupported,
    /// Skipped: disabled through provider policy.
    DisabledByPolicy,
    /// The availability probe returned false or failed outright.
    ProbeFailed,
    QuotaPreflightFail,
    CacheHit,
    CacheMiss,
    /// Accepted because the user forced this provider.
    ForcedByUser,
    /// Accepted as a fallback after earlier candidates failed.
    Fallback,
}

/// One per-candidate record in the selection walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionReasonEntry {
    pub provider_id: ProviderId,
    pub ok: bool,
    pub reason: SelectionReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Immutable record of one provider-selection pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionReport {
    pub id: String,
    pub created_at_ms: u64,
    pub policy_order: Vec<ProviderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected: Option<ProviderId>,
    pub reasons: Vec<SelectionReasonEntry>,
}

impl SelectionReport {
    pub fn new(policy_order: Vec<ProviderId>) -> SelectionReportBuilder {
        SelectionReportBuilder {
            report: SelectionReport {
                id: uuid::Uuid::now_v7().to_string(),
                created_at_ms: now_epoch_ms(),
                policy_order,
                selected: None,
                reasons: Vec::new(),
            },
        }
    }
}

/// Accumulates reasons during the walk; `freeze` yields the immutable
/// report.
#[derive(Debug)]
pub struct SelectionReportBuilder {
    report: SelectionReport,
}

impl SelectionReportBuilder {
    pub fn reject(
        &mut self,
        provider_id: ProviderId,
        reason: SelectionReason,
        details: Option<String>,
    ) {
        self.report.reasons.push(SelectionReasonEntry {
            provider_id,
            ok: false,
            reason,
            details,
        });
    }

    pub fn accept(&mut self, provider_id: ProviderId, reason: SelectionReason) {
        self.report.reasons.push(SelectionReasonEntry {
            provider_id,
            ok: true,
            reason,
            details: None,
        });
        self.report.selected = Some(provider_id);
    }

    pub fn tried(&self) -> Vec<ProviderId> {
        self.report.reasons.iter().map(|r| r.provider_id).collect()
    }

    pub fn freeze(self) -> SelectionReport {
        self.report
    }
}

/// One candidate evaluation in the quota preflight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaAttempt {
    pub model_id: String,
    pub size_bytes: u64,
    pub required_bytes: u64,
    pub margin_bytes: u64,
    pub ok: bool,
    pub estimate_supported: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_bytes: Option<u64>,
}

/// Record of the quota-aware model pre-resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaPreflightReport {
    pub provider_id: ProviderId,
    pub attempts: Vec<QuotaAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_model_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_records_walk_and_freezes() {
        let mut builder = SelectionReport::new(vec![ProviderId::Native, ProviderId::Mock]);
        builder.reject(
            ProviderId::Native,
            SelectionReason::PrivacyMode,
            Some("fully-local-managed".into()),
        );
        builder.accept(ProviderId::Mock, SelectionReason::OrderPolicy);
        assert_eq!(builder.tried(), vec![ProviderId::Native, ProviderId::Mock]);

        let report = builder.freeze();
        assert_eq!(report.selected, Some(ProviderId::Mock));
        assert_eq!(report.reasons.len(), 2);
        assert!(!report.reasons[0].ok);
        assert!(report.reasons[1].ok);
        assert!(!report.id.is_empty());
    }

    #[test]
    fn reason_wire_format_is_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&SelectionReason::ProbeFailed).unwrap(),
            "\"PROBE_FAILED\""
        );
        assert_eq!(
            serde_json::to_string(&SelectionReason::DisabledByPolicy).unwrap(),
            "\"DISABLED_BY_POLICY\""
        );
    }

    #[test]
    fn quota_report_serializes() {
        let report = QuotaPreflightReport {
            provider_id: ProviderId::Webllm,
            attempts: vec![QuotaAttempt {
                model_id: "big".into(),
                size_bytes: 100,
                required_bytes: 105,
                margin_bytes: 5,
                ok: false,
                estimate_supported: true,
                available_bytes: Some(50),
                quota_bytes: Some(1000),
                usage_bytes: Some(950),
            }],
            selected_model_id: None,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["providerId"], "webllm");
        assert_eq!(json["attempts"][0]["requiredBytes"], 105);
    }
}
