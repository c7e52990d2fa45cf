//! Model specifications.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, RuntimeError, RuntimeResult};
use crate::provider::ProviderId;

/// Engine families a model artifact targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFamily {
    Webllm,
    Webnn,
    Wasm,
    Transformersjs,
}

/// Device tiers, largest-capable first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModelTier {
    #[serde(rename = "1")]
    Tier1,
    #[serde(rename = "2")]
    Tier2,
    #[serde(rename = "3")]
    Tier3,
}

impl ModelTier {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(ModelTier::Tier1),
            2 => Some(ModelTier::Tier2),
            3 => Some(ModelTier::Tier3),
            _ => None,
        }
    }
}

/// The one chat-template format the runtime renders itself.
pub const CHAT_TEMPLATE_SIMPLE: &str = "simple";

/// Prompt template descriptor attached to a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTemplate {
    pub format: String,
}

impl ChatTemplate {
    pub fn simple() -> Self {
        Self { format: CHAT_TEMPLATE_SIMPLE.to_string() }
    }
}

/// One deployable model artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub engine: EngineFamily,
    /// Asset location, relative to the configured public base URL unless
    /// absolute.
    pub source: String,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<ModelTier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hf_repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_compat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<ChatTemplate>,
}

impl ModelSpec {
    pub fn new(
        id: impl Into<String>,
        engine: EngineFamily,
        source: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        Self {
            id: id.into(),
            label: None,
            engine,
            source: source.into(),
            size_bytes,
            tier: None,
            context_window_tokens: None,
            hf_repo: None,
            engine_compat: None,
            integrity: None,
            chat_template: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window_tokens = Some(tokens);
        self
    }

    pub fn with_hf_repo(mut self, repo: impl Into<String>) -> Self {
        self.hf_repo = Some(repo.into());
        self
    }

    pub fn with_integrity(mut self, digest: impl Into<String>) -> Self {
        self.integrity = Some(digest.into());
        self
    }

    pub fn with_chat_template(mut self, template: ChatTemplate) -> Self {
        self.chat_template = Some(template);
        self
    }

    /// Sentinel spec for providers that bring their own model (`native`,
    /// `mock`). The size is a placeholder byte so the non-zero invariant
    /// holds; quota preflight skips sentinels entirely.
    pub fn sentinel(provider: ProviderId) -> Self {
        Self::new(
            format!("{provider}-builtin"),
            EngineFamily::Transformersjs,
            "builtin:",
            1,
        )
        .with_label(format!("{provider} built-in model"))
    }

    /// Structural validation.
    ///
    /// A chat template in any format other than `simple` is rejected:
    /// rendering an unknown template risks silently corrupting prompts.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.size_bytes == 0 {
            return Err(RuntimeError::new(
                ErrorCode::InvalidConfig,
                format!("model {} has zero sizeBytes", self.id),
            ));
        }
        if let Some(template) = &self.chat_template {
            if template.format != CHAT_TEMPLATE_SIMPLE {
                return Err(RuntimeError::new(
                    ErrorCode::TemplateFormatUnsupported,
                    format!(
                        "model {} uses chat template format '{}'; only '{}' is supported",
                        self.id, template.format, CHAT_TEMPLATE_SIMPLE
                    ),
                )
                .with_dev_action("ship the model with a 'simple' chat template"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_simple_template() {
        let spec = ModelSpec::new("m", EngineFamily::Wasm, "models/m.bin", 10)
            .with_chat_template(ChatTemplate::simple());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_template() {
        let spec = ModelSpec::new("m", EngineFamily::Wasm, "models/m.bin", 10)
            .with_chat_template(ChatTemplate { format: "jinja2".into() });
        let err = spec.validate().unwrap_err();
        assert_eq!(err.code, ErrorCode::TemplateFormatUnsupported);
    }

    #[test]
    fn validate_rejects_zero_size() {
        let spec = ModelSpec::new("m", EngineFamily::Webllm, "models/m", 0);
        assert_eq!(spec.validate().unwrap_err().code, ErrorCode::InvalidConfig);
    }

    #[test]
    fn sentinel_passes_validation() {
        let spec = ModelSpec::sentinel(ProviderId::Mock);
        assert!(spec.validate().is_ok());
        assert_eq!(spec.id, "mock-builtin");
    }

    #[test]
    fn tier_from_number() {
        assert_eq!(ModelTier::from_number(1), Some(ModelTier::Tier1));
        assert_eq!(ModelTier::from_number(3), Some(ModelTier::Tier3));
        assert_eq!(ModelTier::from_number(4), None);
    }
}
