//! Runtime configuration.
//!
//! The host application hands the orchestrator one [`RuntimeConfig`]
//! describing policy: which providers to try in which order, the privacy
//! posture, where relative model assets resolve from, and how far to
//! stretch state deadlines. Configs are plain serializable values built
//! either programmatically or from a TOML file.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, RuntimeError, RuntimeResult};
use crate::model::ModelTier;
use crate::provider::ProviderId;

/// Privacy posture governing provider eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrivacyMode {
    /// Any available provider, including OS/browser-delegated ones.
    #[default]
    Any,
    /// Only providers whose execution is fully local and runtime-managed;
    /// `native` is skipped because its locality cannot be verified.
    FullyLocalManaged,
}

/// Ordered provider preference plus policy exclusions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPolicy {
    pub order: Vec<ProviderId>,
    /// Providers excluded outright; recorded as `DISABLED_BY_POLICY`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled: Vec<ProviderId>,
    /// User-forced provider; bypasses the order walk when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force: Option<ProviderId>,
}

/// Deadline scaling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    pub multiplier: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self { multiplier: 1.0 }
    }
}

/// Model-choice hints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPolicy {
    /// Preferred model id; still subject to provider whitelist checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_model_id: Option<String>,
    /// Whether smaller fallback candidates may be substituted when the
    /// preferred model does not fit available storage.
    #[serde(default = "default_true")]
    pub allow_fallback: bool,
}

fn default_true() -> bool {
    true
}

/// Application policy handed to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub privacy_mode: PrivacyMode,
    pub provider_policy: ProviderPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
    /// Opaque per-provider options; must stay serializable because they
    /// may cross a worker boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_options: Option<serde_json::Value>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_policy: Option<ModelPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_override: Option<ModelTier>,
}

impl RuntimeConfig {
    pub fn new(order: Vec<ProviderId>) -> Self {
        Self {
            privacy_mode: PrivacyMode::default(),
            provider_policy: ProviderPolicy { order, disabled: vec![], force: None },
            public_base_url: None,
            provider_options: None,
            timeouts: Timeouts::default(),
            model_policy: None,
            tier_override: None,
        }
    }

    pub fn with_privacy_mode(mut self, mode: PrivacyMode) -> Self {
        self.privacy_mode = mode;
        self
    }

    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = Some(url.into());
        self
    }

    pub fn with_provider_options(mut self, options: serde_json::Value) -> Self {
        self.provider_options = Some(options);
        self
    }

    pub fn with_timeout_multiplier(mut self, multiplier: f64) -> Self {
        self.timeouts.multiplier = multiplier;
        self
    }

    pub fn with_model_policy(mut self, policy: ModelPolicy) -> Self {
        self.model_policy = Some(policy);
        self
    }

    pub fn with_tier_override(mut self, tier: ModelTier) -> Self {
        self.tier_override = Some(tier);
        self
    }

    pub fn with_forced_provider(mut self, provider: ProviderId) -> Self {
        self.provider_policy.force = Some(provider);
        self
    }

    pub fn with_disabled_provider(mut self, provider: ProviderId) -> Self {
        self.provider_policy.disabled.push(provider);
        self
    }

    /// True when `provider_options` already carries explicit asset URLs,
    /// which lifts the public-base-URL requirement.
    fn options_supply_urls(&self) -> bool {
        fn contains_url_key(value: &serde_json::Value) -> bool {
            match value {
                serde_json::Value::Object(map) => map.iter().any(|(key, v)| {
                    key.to_ascii_lowercase().contains("url") || contains_url_key(v)
                }),
                serde_json::Value::Array(items) => items.iter().any(contains_url_key),
                _ => false,
            }
        }
        self.provider_options.as_ref().is_some_and(contains_url_key)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.provider_policy.order.is_empty() {
            return Err(RuntimeError::new(
                ErrorCode::InvalidConfig,
                "providerPolicy.order must not be empty",
            )
            .with_dev_action("list at least one provider in providerPolicy.order"));
        }

        if !(self.timeouts.multiplier.is_finite() && self.timeouts.multiplier > 0.0) {
            return Err(RuntimeError::new(
                ErrorCode::InvalidConfig,
                format!("timeouts.multiplier must be > 0, got {}", self.timeouts.multiplier),
            ));
        }

        let needs_base_url = self
            .provider_policy
            .order
            .iter()
            .any(|p| p.requires_asset_fetch());
        if needs_base_url && self.public_base_url.is_none() && !self.options_supply_urls() {
            return Err(RuntimeError::new(
                ErrorCode::PublicBaseUrlRequired,
                "a candidate provider fetches relative model assets but no publicBaseUrl is set",
            )
            .with_dev_action(
                "set publicBaseUrl or supply explicit URLs through providerOptions",
            ));
        }

        Ok(())
    }

    /// Load from a TOML string.
    pub fn from_toml_str(input: &str) -> RuntimeResult<Self> {
        let config: RuntimeConfig = toml::from_str(input).map_err(|e| {
            RuntimeError::new(ErrorCode::InvalidConfig, format!("config parse error: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate from a TOML file.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> RuntimeResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RuntimeError::new(
                ErrorCode::InvalidConfig,
                format!("cannot read config {}: {e}", path.as_ref().display()),
            )
        })?;
        Self::from_toml_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_only_config_is_valid() {
        let config = RuntimeConfig::new(vec![ProviderId::Mock]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_order_is_rejected() {
        let config = RuntimeConfig::new(vec![]);
        assert_eq!(config.validate().unwrap_err().code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn asset_provider_without_base_url_is_rejected() {
        let config = RuntimeConfig::new(vec![ProviderId::Webllm]);
        assert_eq!(
            config.validate().unwrap_err().code,
            ErrorCode::PublicBaseUrlRequired
        );
    }

    #[test]
    fn base_url_satisfies_asset_requirement() {
        let config = RuntimeConfig::new(vec![ProviderId::Webllm])
            .with_public_base_url("https://assets.example.com/models");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn explicit_urls_in_options_satisfy_asset_requirement() {
        let config = RuntimeConfig::new(vec![ProviderId::Wasm]).with_provider_options(
            serde_json::json!({
                "wasm": { "modelUrl": "https://cdn.example.com/m.bin" }
            }),
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_positive_multiplier_is_rejected() {
        let config = RuntimeConfig::new(vec![ProviderId::Mock]).with_timeout_multiplier(0.0);
        assert_eq!(config.validate().unwrap_err().code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn toml_roundtrip() {
        let toml = r#"
            publicBaseUrl = "https://assets.example.com"

            [providerPolicy]
            order = ["mock", "wasm"]

            [timeouts]
            multiplier = 1.5
        "#;
        let config = RuntimeConfig::from_toml_str(toml).unwrap();
        assert_eq!(
            config.provider_policy.order,
            vec![ProviderId::Mock, ProviderId::Wasm]
        );
        assert!((config.timeouts.multiplier - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn toml_missing_base_url_fails_validation() {
        let toml = r#"
            [providerPolicy]
            order = ["smollm"]
        "#;
        let err = RuntimeConfig::from_toml_str(toml).unwrap_err();
        assert_eq!(err.code, ErrorCode::PublicBaseUrlRequired);
    }

    #[test]
    fn privacy_mode_wire_format() {
        assert_eq!(
            serde_json::to_string(&PrivacyMode::FullyLocalManaged).unwrap(),
            "\"fully-local-managed\""
        );
    }
}
