//! Edgerun runtime: the orchestration kernel for client-side local AI
//! inference.
//!
//! Applications hand the [`Orchestrator`](orchestrator::Orchestrator) a
//! policy config and a set of provider adapters; the runtime owns the
//! rest — lifecycle sequencing, provider/model selection, quota
//! preflight, cache and download management, generation streaming with
//! epoch stamping, watchdogs, and teardown.
//!
//! ```rust,ignore
//! use edgerun_kernel::{ChatMessage, GenerateParams, ProviderId, RuntimeConfig};
//! use edgerun_runtime::orchestrator::Orchestrator;
//! use edgerun_runtime::providers::MockProvider;
//!
//! #[tokio::main]
//! async fn main() -> edgerun_kernel::RuntimeResult<()> {
//!     let orchestrator = Orchestrator::builder(RuntimeConfig::new(vec![ProviderId::Mock]))
//!         .with_adapter(MockProvider::builder().build())
//!         .build()?;
//!     orchestrator.init().await?;
//!     let result = orchestrator
//!         .generate(GenerateParams::new(vec![ChatMessage::user("hi")], 64))
//!         .await?;
//!     println!("{}", result.text);
//!     orchestrator.teardown().await
//! }
//! ```

pub mod download;
pub mod model_select;
pub mod orchestrator;
pub mod preflight;
pub mod probe;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod selector;
pub mod watchdog;

pub use download::DownloadLock;
pub use orchestrator::{EventSink, GenerationStream, Orchestrator, OrchestratorBuilder};
pub use providers::MockProvider;
pub use registry::{
    AcquireOptions, ModelBackendKind, ModelEntryInfo, ModelInstance, RegistryConfig,
    SharedModelRegistry,
};
pub use retry::RetryBudget;
pub use selector::{Selection, select_provider};
pub use watchdog::{DownloadWatchdogConfig, GenerationPulse, HealthcheckConfig};
