//! Error taxonomy for the Edgerun runtime.
//!
//! Errors are values, not control-flow: every failure that crosses the
//! orchestrator boundary is a [`RuntimeError`] carrying a stable
//! [`ErrorCode`], a recoverability flag, and optional human-directed
//! hints. Recent errors are retained in a diagnostics ring buffer so a
//! host application can always answer "what went wrong" without having
//! observed the failure live.

use serde::{Deserialize, Serialize};

use crate::provider::ProviderId;
use crate::state::StateKind;

/// Stable error codes.
///
/// The serialized form (`ERROR_*`) is a wire contract: codes never change
/// meaning and are matched by host applications, so variants may be added
/// but not renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCode {
    #[serde(rename = "ERROR_INVALID_CONFIG")]
    InvalidConfig,
    #[serde(rename = "ERROR_INVALID_STATE")]
    InvalidState,
    #[serde(rename = "ERROR_INVALID_INPUT_EMPTY_MESSAGES")]
    InvalidInputEmptyMessages,
    #[serde(rename = "ERROR_TEMPLATE_FORMAT_UNSUPPORTED")]
    TemplateFormatUnsupported,
    #[serde(rename = "ERROR_PROMPT_BUDGET_OVERFLOW")]
    PromptBudgetOverflow,
    #[serde(rename = "ERROR_PROMPT_TOO_LARGE_AFTER_RETRIES")]
    PromptTooLargeAfterRetries,
    #[serde(rename = "ERROR_NATIVE_UNAVAILABLE")]
    NativeUnavailable,
    #[serde(rename = "ERROR_NATIVE_DOWNLOAD_STUCK")]
    NativeDownloadStuck,
    #[serde(rename = "ERROR_WEBLLM_INCOMPATIBLE_MODEL")]
    WebllmIncompatibleModel,
    #[serde(rename = "ERROR_WEBGPU_DEVICE_LOST")]
    WebgpuDeviceLost,
    #[serde(rename = "ERROR_WORKER_CRASH")]
    WorkerCrash,
    #[serde(rename = "ERROR_TIMEOUT")]
    Timeout,
    #[serde(rename = "ERROR_ABORTED")]
    Aborted,
    #[serde(rename = "ERROR_QUOTA_PREFLIGHT_FAIL")]
    QuotaPreflightFail,
    #[serde(rename = "ERROR_QUOTA_EXCEEDED")]
    QuotaExceeded,
    #[serde(rename = "ERROR_CACHE_DESYNC_REPAIRED")]
    CacheDesyncRepaired,
    #[serde(rename = "ERROR_CACHE_CORRUPT")]
    CacheCorrupt,
    #[serde(rename = "ERROR_NETWORK")]
    Network,
    #[serde(rename = "ERROR_GENERATION_STALLED")]
    GenerationStalled,
    #[serde(rename = "ERROR_HEALTHCHECK_TIMEOUT_DURING_GENERATION")]
    HealthcheckTimeoutDuringGeneration,
    #[serde(rename = "ERROR_PUBLIC_BASE_URL_REQUIRED")]
    PublicBaseUrlRequired,
    #[serde(rename = "ERROR_UNKNOWN")]
    Unknown,
}

impl ErrorCode {
    /// The stable wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "ERROR_INVALID_CONFIG",
            ErrorCode::InvalidState => "ERROR_INVALID_STATE",
            ErrorCode::InvalidInputEmptyMessages => "ERROR_INVALID_INPUT_EMPTY_MESSAGES",
            ErrorCode::TemplateFormatUnsupported => "ERROR_TEMPLATE_FORMAT_UNSUPPORTED",
            ErrorCode::PromptBudgetOverflow => "ERROR_PROMPT_BUDGET_OVERFLOW",
            ErrorCode::PromptTooLargeAfterRetries => "ERROR_PROMPT_TOO_LARGE_AFTER_RETRIES",
            ErrorCode::NativeUnavailable => "ERROR_NATIVE_UNAVAILABLE",
            ErrorCode::NativeDownloadStuck => "ERROR_NATIVE_DOWNLOAD_STUCK",
            ErrorCode::WebllmIncompatibleModel => "ERROR_WEBLLM_INCOMPATIBLE_MODEL",
            ErrorCode::WebgpuDeviceLost => "ERROR_WEBGPU_DEVICE_LOST",
            ErrorCode::WorkerCrash => "ERROR_WORKER_CRASH",
            ErrorCode::Timeout => "ERROR_TIMEOUT",
            ErrorCode::Aborted => "ERROR_ABORTED",
            ErrorCode::QuotaPreflightFail => "ERROR_QUOTA_PREFLIGHT_FAIL",
            ErrorCode::QuotaExceeded => "ERROR_QUOTA_EXCEEDED",
            ErrorCode::CacheDesyncRepaired => "ERROR_CACHE_DESYNC_REPAIRED",
            ErrorCode::CacheCorrupt => "ERROR_CACHE_CORRUPT",
            ErrorCode::Network => "ERROR_NETWORK",
            ErrorCode::GenerationStalled => "ERROR_GENERATION_STALLED",
            ErrorCode::HealthcheckTimeoutDuringGeneration => {
                "ERROR_HEALTHCHECK_TIMEOUT_DURING_GENERATION"
            }
            ErrorCode::PublicBaseUrlRequired => "ERROR_PUBLIC_BASE_URL_REQUIRED",
            ErrorCode::Unknown => "ERROR_UNKNOWN",
        }
    }

    /// Default recoverability for this code.
    ///
    /// Individual errors may override (e.g. a network error during an
    /// optional prefetch), but most call sites take the default.
    pub fn default_recoverability(&self) -> Recoverability {
        match self {
            // Transient conditions a rehydration pass can plausibly clear.
            ErrorCode::NativeDownloadStuck
            | ErrorCode::WebgpuDeviceLost
            | ErrorCode::WorkerCrash
            | ErrorCode::Timeout
            | ErrorCode::Network
            | ErrorCode::GenerationStalled
            | ErrorCode::HealthcheckTimeoutDuringGeneration
            | ErrorCode::Unknown => Recoverability::Recoverable,
            // Everything else needs a config, input, or environment change.
            _ => Recoverability::NonRecoverable,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the state machine should offer rehydration after this error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Recoverability {
    Recoverable,
    NonRecoverable,
}

impl Recoverability {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Recoverability::Recoverable)
    }
}

/// The runtime's error value.
///
/// Carries everything diagnostics needs: a stable code, where the failure
/// happened (`at_state` / `at_provider`), and hints for the user and the
/// integrating developer.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct RuntimeError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverability: Recoverability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_state: Option<StateKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_provider: Option<ProviderId>,
    pub timestamp_ms: u64,
}

impl RuntimeError {
    /// New error with the code's default recoverability.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverability: code.default_recoverability(),
            cause: None,
            details: None,
            user_action: None,
            dev_action: None,
            at_state: None,
            at_provider: None,
            timestamp_ms: crate::now_epoch_ms(),
        }
    }

    pub fn with_recoverability(mut self, recoverability: Recoverability) -> Self {
        self.recoverability = recoverability;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_user_action(mut self, action: impl Into<String>) -> Self {
        self.user_action = Some(action.into());
        self
    }

    pub fn with_dev_action(mut self, action: impl Into<String>) -> Self {
        self.dev_action = Some(action.into());
        self
    }

    pub fn at_state(mut self, state: StateKind) -> Self {
        self.at_state = Some(state);
        self
    }

    pub fn at_provider(mut self, provider: ProviderId) -> Self {
        self.at_provider = Some(provider);
        self
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverability.is_recoverable()
    }

    /// Cancellation of an in-flight generation. Not a failure: the machine
    /// returns to `Ready` and partial output stays with the caller.
    pub fn aborted() -> Self {
        Self::new(ErrorCode::Aborted, "generation aborted")
            .with_recoverability(Recoverability::Recoverable)
    }

    /// A transition that the static allow-list rejects.
    pub fn invalid_transition(from: StateKind, to: StateKind) -> Self {
        Self::new(
            ErrorCode::InvalidState,
            format!("transition {from} -> {to} is not allowed"),
        )
        .at_state(from)
    }

    /// An operation invoked in a state where it is not available.
    pub fn invalid_state(operation: &str, current: StateKind) -> Self {
        Self::new(
            ErrorCode::InvalidState,
            format!("{operation} is not available in state {current}"),
        )
        .at_state(current)
    }

    pub fn timeout(state: StateKind, deadline_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("state {state} exceeded its {deadline_ms} ms deadline"),
        )
        .at_state(state)
    }
}

/// Convenience result alias used across the workspace.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_are_stable() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::NativeUnavailable).unwrap(),
            "\"ERROR_NATIVE_UNAVAILABLE\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::HealthcheckTimeoutDuringGeneration).unwrap(),
            "\"ERROR_HEALTHCHECK_TIMEOUT_DURING_GENERATION\""
        );
        let back: ErrorCode = serde_json::from_str("\"ERROR_ABORTED\"").unwrap();
        assert_eq!(back, ErrorCode::Aborted);
    }

    #[test]
    fn display_matches_wire_string() {
        assert_eq!(
            ErrorCode::QuotaPreflightFail.to_string(),
            "ERROR_QUOTA_PREFLIGHT_FAIL"
        );
    }

    #[test]
    fn default_recoverability() {
        assert!(
            ErrorCode::WorkerCrash
                .default_recoverability()
                .is_recoverable()
        );
        assert!(
            !ErrorCode::QuotaPreflightFail
                .default_recoverability()
                .is_recoverable()
        );
        assert!(!ErrorCode::InvalidConfig.default_recoverability().is_recoverable());
    }

    #[test]
    fn builder_attaches_context() {
        let err = RuntimeError::new(ErrorCode::Network, "fetch failed")
            .with_user_action("Check your connection")
            .with_dev_action("inspect the asset URL")
            .at_state(StateKind::Downloading)
            .at_provider(ProviderId::Webllm);

        assert_eq!(err.code, ErrorCode::Network);
        assert!(err.is_recoverable());
        assert_eq!(err.at_state, Some(StateKind::Downloading));
        assert_eq!(err.at_provider, Some(ProviderId::Webllm));
        assert!(err.to_string().contains("ERROR_NETWORK"));
    }

    #[test]
    fn aborted_is_recoverable() {
        let err = RuntimeError::aborted();
        assert_eq!(err.code, ErrorCode::Aborted);
        assert!(err.is_recoverable());
    }

    #[test]
    fn serde_roundtrip_keeps_camel_case_fields() {
        let err = RuntimeError::new(ErrorCode::Timeout, "too slow")
            .with_user_action("retry");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "ERROR_TIMEOUT");
        assert_eq!(json["userAction"], "retry");
        assert_eq!(json["recoverability"], "recoverable");
        let back: RuntimeError = serde_json::from_value(json).unwrap();
        assert_eq!(back.code, ErrorCode::Timeout);
    }
}
