//! Edgerun kernel: contracts and value types for the local-inference
//! orchestration runtime.
//!
//! This crate holds everything the orchestrator and its collaborators
//! agree on, with no platform calls of its own:
//!
//! - [`error`] — the stable error taxonomy (`ERROR_*` codes,
//!   recoverability, diagnostics context)
//! - [`state`] — the 13-state lifecycle machine with a static transition
//!   allow-list, deadlines, and ordered subscribers
//! - [`envelope`] — epoch/sequence stamping and the late-event gate
//! - [`config`] — application policy (provider order, privacy mode,
//!   timeouts, model hints)
//! - [`model`] — model specifications and chat-template validation
//! - [`provider`] — the opaque provider-adapter contract
//!   (`detect/init/generate/abort/teardown`)
//! - [`env`] — device fingerprint and capability records
//! - [`selection`] — immutable selection and quota-preflight reports
//! - [`diagnostics`] — the aggregated snapshot (`schemaVersion: "1"`)
//!
//! Implementations live in `edgerun-storage` and `edgerun-runtime`.

pub mod config;
pub mod diagnostics;
pub mod env;
pub mod envelope;
pub mod error;
pub mod model;
pub mod provider;
pub mod selection;
pub mod state;

pub use config::{ModelPolicy, PrivacyMode, ProviderPolicy, RuntimeConfig, Timeouts};
pub use diagnostics::{DiagnosticsSnapshot, ErrorRing, RepairOutcome};
pub use env::{Capabilities, DeviceFingerprint};
pub use envelope::{Envelope, EnvelopeStamper, EpochClock, EpochGate, GenerationEvent};
pub use error::{ErrorCode, Recoverability, RuntimeError, RuntimeResult};
pub use model::{ChatTemplate, EngineFamily, ModelSpec, ModelTier};
pub use provider::{
    ChatMessage, DetectOutcome, DownloadProgress, GenerateParams, GenerateResult, InitHooks,
    ProviderAdapter, ProviderId, ProviderResponse, ProviderSupports, Role, RuntimeMode,
    TokenUsage,
};
pub use selection::{QuotaAttempt, QuotaPreflightReport, SelectionReason, SelectionReport};
pub use state::{
    DownloadVariant, ListenerId, RuntimeState, StateKind, StateMachine, StateSnapshot,
};

/// Milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
