//! Provider selection.
//!
//! Walks the policy order, probing each registered adapter, and records
//! one reason per candidate into an immutable [`SelectionReport`]. The
//! first available candidate wins. When the user forces a provider, only
//! that provider is tried.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use edgerun_kernel::config::{PrivacyMode, RuntimeConfig};
use edgerun_kernel::provider::{ProviderAdapter, ProviderId};
use edgerun_kernel::selection::{SelectionReason, SelectionReport};

/// Result of a selection walk.
pub struct Selection {
    pub provider: Option<Arc<dyn ProviderAdapter>>,
    pub report: SelectionReport,
    /// Detect outcome of the accepted provider; the orchestrator reads
    /// the capability record and privacy claim from here.
    pub outcome: Option<edgerun_kernel::provider::DetectOutcome>,
}

impl Selection {
    /// True when every rejection was policy-driven (privacy mode or
    /// disabled-by-policy), i.e. the runtime should park in `Disabled`
    /// rather than fail.
    pub fn all_rejections_by_policy(&self) -> bool {
        !self.report.reasons.is_empty()
            && self.report.reasons.iter().all(|r| {
                matches!(
                    r.reason,
                    SelectionReason::PrivacyMode | SelectionReason::DisabledByPolicy
                )
            })
    }
}

/// Run the selection walk.
pub async fn select_provider(
    config: &RuntimeConfig,
    adapters: &HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
) -> Selection {
    let order: Vec<ProviderId> = match config.provider_policy.force {
        Some(forced) => vec![forced],
        None => config.provider_policy.order.clone(),
    };
    let forced = config.provider_policy.force.is_some();
    let mut report = SelectionReport::new(order.clone());

    for provider_id in order {
        if config.provider_policy.disabled.contains(&provider_id) {
            debug!(%provider_id, "provider disabled by policy");
            report.reject(provider_id, SelectionReason::DisabledByPolicy, None);
            continue;
        }

        // `native` delegates to a host-provided model with unknown
        // locality guarantees; a fully-local-managed posture excludes it.
        if config.privacy_mode == PrivacyMode::FullyLocalManaged
            && provider_id == ProviderId::Native
        {
            debug!(%provider_id, "provider excluded by privacy mode");
            report.reject(
                provider_id,
                SelectionReason::PrivacyMode,
                Some("fully-local-managed excludes delegated providers".into()),
            );
            continue;
        }

        let Some(adapter) = adapters.get(&provider_id) else {
            report.reject(
                provider_id,
                SelectionReason::Unsupported,
                Some("no adapter registered".into()),
            );
            continue;
        };

        match adapter.detect(config).await {
            Ok(outcome) if outcome.available => {
                let reason = if forced {
                    SelectionReason::ForcedByUser
                } else {
                    SelectionReason::OrderPolicy
                };
                info!(%provider_id, ?reason, "provider selected");
                report.accept(provider_id, reason);
                return Selection {
                    provider: Some(Arc::clone(adapter)),
                    report: report.freeze(),
                    outcome: Some(outcome),
                };
            }
            Ok(outcome) => {
                debug!(%provider_id, reason = ?outcome.reason, "probe returned unavailable");
                report.reject(provider_id, SelectionReason::ProbeFailed, outcome.reason);
            }
            Err(err) => {
                warn!(%provider_id, error = %err, "probe failed");
                report.reject(
                    provider_id,
                    SelectionReason::ProbeFailed,
                    Some(err.to_string()),
                );
            }
        }
    }

    Selection { provider: None, report: report.freeze(), outcome: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;
    use edgerun_kernel::provider::ProviderSupports;

    fn adapters(
        providers: Vec<Arc<dyn ProviderAdapter>>,
    ) -> HashMap<ProviderId, Arc<dyn ProviderAdapter>> {
        providers.into_iter().map(|p| (p.id(), p)).collect()
    }

    #[tokio::test]
    async fn first_available_provider_wins_with_order_policy() {
        let mock = MockProvider::builder().build();
        let selection = select_provider(
            &RuntimeConfig::new(vec![ProviderId::Mock]),
            &adapters(vec![mock]),
        )
        .await;

        assert!(selection.provider.is_some());
        let report = &selection.report;
        assert_eq!(report.selected, Some(ProviderId::Mock));
        assert_eq!(report.reasons.len(), 1);
        assert_eq!(report.reasons[0].reason, SelectionReason::OrderPolicy);
        assert!(report.reasons[0].ok);
    }

    #[tokio::test]
    async fn unregistered_provider_is_unsupported() {
        let mock = MockProvider::builder().build();
        let config = RuntimeConfig::new(vec![ProviderId::Webnn, ProviderId::Mock]);
        let selection = select_provider(&config, &adapters(vec![mock])).await;

        let report = &selection.report;
        assert_eq!(report.reasons[0].reason, SelectionReason::Unsupported);
        assert_eq!(report.reasons[1].reason, SelectionReason::OrderPolicy);
        assert_eq!(report.selected, Some(ProviderId::Mock));
    }

    #[tokio::test]
    async fn privacy_mode_skips_native() {
        let native = MockProvider::builder().with_id(ProviderId::Native).build();
        let mock = MockProvider::builder().build();
        let config = RuntimeConfig::new(vec![ProviderId::Native, ProviderId::Mock])
            .with_privacy_mode(PrivacyMode::FullyLocalManaged);

        let selection = select_provider(&config, &adapters(vec![native, mock])).await;
        let report = &selection.report;
        assert_eq!(report.reasons[0].reason, SelectionReason::PrivacyMode);
        assert_eq!(report.selected, Some(ProviderId::Mock));
    }

    #[tokio::test]
    async fn unavailable_probe_is_recorded() {
        let mock = MockProvider::builder()
            .detect_unavailable("GPU adapter missing")
            .build();
        let selection = select_provider(
            &RuntimeConfig::new(vec![ProviderId::Mock]),
            &adapters(vec![mock]),
        )
        .await;

        assert!(selection.provider.is_none());
        let entry = &selection.report.reasons[0];
        assert_eq!(entry.reason, SelectionReason::ProbeFailed);
        assert_eq!(entry.details.as_deref(), Some("GPU adapter missing"));
        assert!(!selection.all_rejections_by_policy());
    }

    #[tokio::test]
    async fn forced_provider_bypasses_order() {
        let mock = MockProvider::builder().build();
        let wasm = MockProvider::builder()
            .with_id(ProviderId::Wasm)
            .with_supports(ProviderSupports {
                streaming: true,
                abort: true,
                system_role: false,
                download_progress: false,
            })
            .build();
        let config = RuntimeConfig::new(vec![ProviderId::Wasm, ProviderId::Mock])
            .with_public_base_url("https://assets.example.com")
            .with_forced_provider(ProviderId::Mock);

        let selection = select_provider(&config, &adapters(vec![mock, wasm])).await;
        let report = &selection.report;
        assert_eq!(report.selected, Some(ProviderId::Mock));
        assert_eq!(report.reasons[0].reason, SelectionReason::ForcedByUser);
    }

    #[tokio::test]
    async fn policy_only_rejections_flag_disabled() {
        let native = MockProvider::builder().with_id(ProviderId::Native).build();
        let config = RuntimeConfig::new(vec![ProviderId::Native])
            .with_privacy_mode(PrivacyMode::FullyLocalManaged);

        let selection = select_provider(&config, &adapters(vec![native])).await;
        assert!(selection.provider.is_none());
        assert!(selection.all_rejections_by_policy());
    }
}
