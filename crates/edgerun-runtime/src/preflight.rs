//! Quota-aware model pre-resolution.
//!
//! Runs entirely in memory *before* the state machine enters the
//! preflight state, so the machine performs exactly one
//! `PreflightQuota → CheckingCache` transition instead of oscillating
//! through candidates. Every candidate evaluation is recorded in the
//! [`QuotaPreflightReport`] whether it passed or not.

use std::sync::Arc;

use tracing::{debug, info, warn};

use edgerun_kernel::error::{ErrorCode, RuntimeError, RuntimeResult};
use edgerun_kernel::model::ModelSpec;
use edgerun_kernel::provider::ProviderId;
use edgerun_kernel::selection::{QuotaAttempt, QuotaPreflightReport};
use edgerun_storage::quota::{DEFAULT_QUOTA_SAFETY_MARGIN, QuotaEstimator, required_bytes};

/// Resolve the first candidate that fits available storage.
///
/// `candidates` is the primary followed by its smaller fallbacks. When the
/// estimator is unsupported the first candidate is accepted as-is: gating
/// on a number the platform cannot produce would reject incorrectly.
pub async fn resolve_with_quota(
    provider_id: ProviderId,
    candidates: Vec<ModelSpec>,
    estimator: &Arc<dyn QuotaEstimator>,
) -> RuntimeResult<(ModelSpec, QuotaPreflightReport)> {
    let estimate = estimator.estimate().await.map_err(RuntimeError::from)?;
    let mut report = QuotaPreflightReport {
        provider_id,
        attempts: Vec::with_capacity(candidates.len()),
        selected_model_id: None,
    };

    for candidate in candidates {
        let required = required_bytes(candidate.size_bytes, DEFAULT_QUOTA_SAFETY_MARGIN);
        let margin = required - candidate.size_bytes;
        let available = estimate.available_bytes();
        let ok = !estimate.supported || available.is_some_and(|a| a >= required);

        report.attempts.push(QuotaAttempt {
            model_id: candidate.id.clone(),
            size_bytes: candidate.size_bytes,
            required_bytes: required,
            margin_bytes: margin,
            ok,
            estimate_supported: estimate.supported,
            available_bytes: available,
            quota_bytes: estimate.quota_bytes,
            usage_bytes: estimate.usage_bytes,
        });

        if ok {
            info!(
                %provider_id,
                model_id = %candidate.id,
                required,
                available = available.unwrap_or_default(),
                "quota preflight passed"
            );
            report.selected_model_id = Some(candidate.id.clone());
            return Ok((candidate, report));
        }
        debug!(model_id = %candidate.id, required, ?available, "candidate does not fit");
    }

    warn!(%provider_id, attempts = report.attempts.len(), "no candidate fits available storage");
    Err(RuntimeError::new(
        ErrorCode::QuotaPreflightFail,
        "no candidate model fits the available storage",
    )
    .with_user_action("Free up local storage")
    .with_details(serde_json::to_value(&report).unwrap_or_default())
    .at_provider(provider_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgerun_kernel::model::EngineFamily;
    use edgerun_storage::quota::FixedQuotaEstimator;

    fn spec(id: &str, size: u64) -> ModelSpec {
        ModelSpec::new(id, EngineFamily::Webllm, format!("models/{id}"), size)
    }

    fn estimator(quota: u64, usage: u64) -> Arc<dyn QuotaEstimator> {
        Arc::new(FixedQuotaEstimator::new(quota, usage))
    }

    #[tokio::test]
    async fn primary_fitting_is_selected_first() {
        let (selected, report) = resolve_with_quota(
            ProviderId::Webllm,
            vec![spec("big", 100), spec("small", 10)],
            &estimator(1_000, 0),
        )
        .await
        .unwrap();

        assert_eq!(selected.id, "big");
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(report.selected_model_id.as_deref(), Some("big"));
    }

    #[tokio::test]
    async fn falls_back_to_first_fitting_candidate() {
        // available = 800 MB analog; two fallbacks, only the last fits.
        let (selected, report) = resolve_with_quota(
            ProviderId::Webllm,
            vec![
                spec("standard", 4_500),
                spec("nano", 705),
                spec("micro", 600),
            ],
            &estimator(1_000, 200),
        )
        .await
        .unwrap();

        assert_eq!(selected.id, "micro");
        let oks: Vec<bool> = report.attempts.iter().map(|a| a.ok).collect();
        assert_eq!(oks, vec![false, false, true]);
        assert_eq!(report.selected_model_id.as_deref(), Some("micro"));
    }

    #[tokio::test]
    async fn margin_is_five_percent_rounded_up() {
        let (_, report) = resolve_with_quota(
            ProviderId::Webllm,
            vec![spec("m", 1_000)],
            &estimator(10_000, 0),
        )
        .await
        .unwrap();

        assert_eq!(report.attempts[0].required_bytes, 1_050);
        assert_eq!(report.attempts[0].margin_bytes, 50);
    }

    #[tokio::test]
    async fn exhausted_candidates_fail_with_user_action() {
        let err = resolve_with_quota(
            ProviderId::Webllm,
            vec![spec("a", 500), spec("b", 400)],
            &estimator(100, 0),
        )
        .await
        .unwrap_err();

        assert_eq!(err.code, ErrorCode::QuotaPreflightFail);
        assert!(!err.is_recoverable());
        assert_eq!(err.user_action.as_deref(), Some("Free up local storage"));
    }

    #[tokio::test]
    async fn unsupported_estimator_admits_primary() {
        let est: Arc<dyn QuotaEstimator> = Arc::new(FixedQuotaEstimator::unsupported());
        let (selected, report) =
            resolve_with_quota(ProviderId::Wasm, vec![spec("huge", u64::MAX / 2)], &est)
                .await
                .unwrap();

        assert_eq!(selected.id, "huge");
        assert!(report.attempts[0].ok);
        assert!(!report.attempts[0].estimate_supported);
        assert!(report.attempts[0].available_bytes.is_none());
    }
}
