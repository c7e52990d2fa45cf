//! Provider adapter contract.
//!
//! A provider adapter wraps one backend family (GPU-accelerated engine,
//! CPU/WASM engine, OS-native delegate, test mock) behind a uniform
//! `detect / init / generate / abort / teardown` surface. The orchestrator
//! treats adapters as opaque: it never reaches into engine internals, only
//! observes callbacks and the per-request cancellation token.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::error::RuntimeResult;
use crate::model::ModelSpec;

/// Backend families the runtime can orchestrate.
///
/// A closed enumeration: selectors and policy checks match on it
/// exhaustively, so growing it is a deliberate, compiler-guided change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    /// OS/browser-provided model with unknown locality guarantees.
    Native,
    /// GPU-accelerated engine.
    Webllm,
    /// Neural-network API delegate.
    Webnn,
    /// CPU engine compiled to portable bytecode.
    Wasm,
    /// Deterministic in-process test double.
    Mock,
    /// Small-model CPU engine.
    Smollm,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Native => "native",
            ProviderId::Webllm => "webllm",
            ProviderId::Webnn => "webnn",
            ProviderId::Wasm => "wasm",
            ProviderId::Mock => "mock",
            ProviderId::Smollm => "smollm",
        }
    }

    /// Providers that fetch model assets relative to a base URL.
    ///
    /// When any of these appear in the policy order and no explicit URLs
    /// are supplied through provider options, the config must carry a
    /// public base URL.
    pub fn requires_asset_fetch(&self) -> bool {
        matches!(
            self,
            ProviderId::Webllm | ProviderId::Wasm | ProviderId::Smollm
        )
    }

    /// Sentinel-model providers skip model sizing and quota preflight.
    pub fn uses_sentinel_model(&self) -> bool {
        matches!(self, ProviderId::Native | ProviderId::Mock)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(ProviderId::Native),
            "webllm" => Ok(ProviderId::Webllm),
            "webnn" => Ok(ProviderId::Webnn),
            "wasm" => Ok(ProviderId::Wasm),
            "mock" => Ok(ProviderId::Mock),
            "smollm" => Ok(ProviderId::Smollm),
            other => Err(format!("unknown provider id: {other}")),
        }
    }
}

/// Where the selected runtime actually executes, as claimed by the
/// provider at detect time. Surfaced verbatim in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeMode {
    FullyLocalManaged,
    BrowserDelegatedUnknown,
    BrowserDelegatedOnDeviceClaimed,
}

/// Capability record returned by `detect`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSupports {
    pub streaming: bool,
    pub abort: bool,
    pub system_role: bool,
    pub download_progress: bool,
}

/// Result of a provider availability probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectOutcome {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privacy_claim: Option<RuntimeMode>,
    pub supports: ProviderSupports,
}

impl DetectOutcome {
    pub fn available(supports: ProviderSupports) -> Self {
        Self { available: true, reason: None, privacy_claim: None, supports }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
            privacy_claim: None,
            supports: ProviderSupports::default(),
        }
    }

    pub fn with_privacy_claim(mut self, claim: RuntimeMode) -> Self {
        self.privacy_claim = Some(claim);
        self
    }
}

/// Message roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Parameters for one generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateParams {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl GenerateParams {
    pub fn new(messages: Vec<ChatMessage>, max_tokens: u32) -> Self {
        Self { messages, max_tokens, temperature: None, top_p: None }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

/// Token accounting on a completed generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Raw provider-side generation result.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub usage: Option<TokenUsage>,
    pub provider_id: ProviderId,
    pub model_id: Option<String>,
}

/// Orchestrator-facing generation result; adds selection provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResult {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub provider_id: ProviderId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_report_id: Option<String>,
}

/// Progress snapshot for a model download.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Byte-progress callback, invoked with monotone non-decreasing counts.
pub type ProgressFn = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Per-token callback during generation.
pub type TokenSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Fired by a provider after it rebuilt its engine from cached init
/// config (post-abort corruption recovery); the orchestrator resets the
/// generation silence timer in response.
pub type RecreateHook = Arc<dyn Fn() + Send + Sync>;

/// Hooks handed to `init`.
#[derive(Clone, Default)]
pub struct InitHooks {
    pub on_progress: Option<ProgressFn>,
    pub on_recreate: Option<RecreateHook>,
    /// Cancels an in-flight init (download included). Cooperative.
    pub cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for InitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitHooks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_recreate", &self.on_recreate.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// The adapter contract every backend implements.
///
/// Required semantics:
/// - `abort` must cause a pending `generate` to either complete with
///   partial text or fail with `ERROR_ABORTED`; it is idempotent.
/// - `init` must be idempotent and, when given a progress hook, invoke it
///   with monotone non-decreasing byte counts.
/// - `generate` observes the cancellation token cooperatively; if the
///   engine cannot stop, the adapter escalates (e.g. terminates its
///   worker) and flags an engine rebuild for the next request.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Probe availability. May fail; a failure is recorded as a probe
    /// failure by the selector rather than ending selection.
    async fn detect(&self, config: &RuntimeConfig) -> RuntimeResult<DetectOutcome>;

    /// Prepare the engine; may download model assets.
    async fn init(
        &self,
        config: &RuntimeConfig,
        model: Option<&ModelSpec>,
        hooks: InitHooks,
    ) -> RuntimeResult<()>;

    /// Run one generation, streaming tokens through `on_token`.
    async fn generate(
        &self,
        params: GenerateParams,
        on_token: TokenSink,
        cancel: CancellationToken,
    ) -> RuntimeResult<ProviderResponse>;

    /// Idempotent.
    async fn abort(&self);

    async fn teardown(&self);

    /// Snapshot of the current download, when one is in flight.
    fn download_progress(&self) -> Option<DownloadProgress> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_roundtrip() {
        for id in [
            ProviderId::Native,
            ProviderId::Webllm,
            ProviderId::Webnn,
            ProviderId::Wasm,
            ProviderId::Mock,
            ProviderId::Smollm,
        ] {
            let parsed: ProviderId = id.as_str().parse().unwrap();
            assert_eq!(parsed, id);
            let json = serde_json::to_string(&id).unwrap();
            assert_eq!(json, format!("\"{}\"", id.as_str()));
        }
        assert!("gguf".parse::<ProviderId>().is_err());
    }

    #[test]
    fn asset_fetch_classification() {
        assert!(ProviderId::Webllm.requires_asset_fetch());
        assert!(ProviderId::Smollm.requires_asset_fetch());
        assert!(!ProviderId::Native.requires_asset_fetch());
        assert!(!ProviderId::Mock.requires_asset_fetch());
    }

    #[test]
    fn sentinel_providers() {
        assert!(ProviderId::Native.uses_sentinel_model());
        assert!(ProviderId::Mock.uses_sentinel_model());
        assert!(!ProviderId::Webllm.uses_sentinel_model());
    }

    #[test]
    fn detect_outcome_constructors() {
        let ok = DetectOutcome::available(ProviderSupports {
            streaming: true,
            abort: true,
            system_role: true,
            download_progress: false,
        })
        .with_privacy_claim(RuntimeMode::FullyLocalManaged);
        assert!(ok.available);
        assert_eq!(ok.privacy_claim, Some(RuntimeMode::FullyLocalManaged));

        let missing = DetectOutcome::unavailable("no GPU adapter");
        assert!(!missing.available);
        assert_eq!(missing.reason.as_deref(), Some("no GPU adapter"));
        assert!(!missing.supports.streaming);
    }

    #[test]
    fn chat_message_constructors() {
        assert_eq!(ChatMessage::system("s").role, Role::System);
        assert_eq!(ChatMessage::user("u").role, Role::User);
        assert_eq!(ChatMessage::assistant("a").role, Role::Assistant);
    }

    #[test]
    fn runtime_mode_wire_format() {
        assert_eq!(
            serde_json::to_string(&RuntimeMode::BrowserDelegatedUnknown).unwrap(),
            "\"browser-delegated-unknown\""
        );
    }
}
