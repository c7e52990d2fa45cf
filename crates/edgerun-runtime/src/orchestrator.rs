//! The orchestration core.
//!
//! Composes the state machine, selectors, storage layer, shared model
//! registry, watchdogs, and retry budgeter into the public surface:
//! `init / generate / generate_stream / abort / rehydrate / teardown /
//! diagnostics / subscribe`.
//!
//! The orchestrator is single-flight by construction: `can_generate`
//! holds only in `Ready`, at most one download runs per process (advisory
//! lock), and every generation is stamped with a fresh epoch so late
//! events from superseded requests are droppable by any consumer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use edgerun_kernel::config::{PrivacyMode, RuntimeConfig};
use edgerun_kernel::diagnostics::{
    AdapterDiag, CacheDiag, DIAGNOSTICS_SCHEMA_VERSION, DiagnosticsSnapshot, ErrorRing,
    PrivacyDiag, RepairOutcome, SloDiag, StorageDiag, SystemPromptLocation, Timings,
};
use edgerun_kernel::env::{Capabilities, DeviceFingerprint};
use edgerun_kernel::envelope::{EnvelopeStamper, EpochClock, GenerationEvent};
use edgerun_kernel::error::{ErrorCode, RuntimeError, RuntimeResult};
use edgerun_kernel::model::ModelSpec;
use edgerun_kernel::now_epoch_ms;
use edgerun_kernel::provider::{
    GenerateParams, GenerateResult, InitHooks, ProviderAdapter, ProviderId, ProviderSupports,
    RuntimeMode, TokenSink,
};
use edgerun_kernel::selection::{QuotaPreflightReport, SelectionReport};
use edgerun_kernel::state::{
    DownloadVariant, ListenerId, RuntimeState, StateKind, StateListener, StateMachine,
    StateSnapshot,
};
use edgerun_storage::lru::LruCacheManager;
use edgerun_storage::metadata::ModelRecord;
use edgerun_storage::quota::{DiskQuotaEstimator, QuotaEstimator};
use edgerun_storage::repair::auto_repair;
use edgerun_storage::{ContentCache, MetadataIndex};

use crate::download::DownloadLock;
use crate::model_select::{fallback_candidates, select_model};
use crate::preflight::resolve_with_quota;
use crate::registry::SharedModelRegistry;
use crate::selector::select_provider;
use crate::watchdog::{
    DownloadWatchdogConfig, GenerationPulse, HealthcheckConfig, spawn_download_watchdog,
    spawn_healthcheck,
};
use crate::{probe, retry::RetryBudget};

/// Rehydration attempts before an error becomes terminal.
const MAX_REHYDRATE_ATTEMPTS: u32 = 3;

/// Consumer callback for streamed generation events.
pub type EventSink = Arc<dyn Fn(GenerationEvent) + Send + Sync>;

/// A running generation stream: the event sequence plus the final result.
pub struct GenerationStream {
    pub events: ReceiverStream<GenerationEvent>,
    pub result: tokio::task::JoinHandle<RuntimeResult<GenerateResult>>,
}

#[derive(Clone)]
struct ActiveSession {
    provider: Arc<dyn ProviderAdapter>,
    model: ModelSpec,
}

/// Builder for [`Orchestrator`].
///
/// Process-wide collaborators (registry, download lock, estimator) are
/// injected here rather than reached for globally, so tests compose a
/// fully hermetic instance.
pub struct OrchestratorBuilder {
    config: RuntimeConfig,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    storage_root: Option<PathBuf>,
    storage: Option<LruCacheManager>,
    estimator: Option<Arc<dyn QuotaEstimator>>,
    registry: Option<Arc<SharedModelRegistry>>,
    download_lock: Option<DownloadLock>,
    healthcheck: HealthcheckConfig,
    download_watchdog: DownloadWatchdogConfig,
    env_override: Option<(DeviceFingerprint, Capabilities)>,
}

impl OrchestratorBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            adapters: Vec::new(),
            storage_root: None,
            storage: None,
            estimator: None,
            registry: None,
            download_lock: None,
            healthcheck: HealthcheckConfig::default(),
            download_watchdog: DownloadWatchdogConfig::default(),
            env_override: None,
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    pub fn with_storage(mut self, storage: LruCacheManager) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn QuotaEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    pub fn with_registry(mut self, registry: Arc<SharedModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_download_lock(mut self, lock: DownloadLock) -> Self {
        self.download_lock = Some(lock);
        self
    }

    pub fn with_healthcheck_config(mut self, config: HealthcheckConfig) -> Self {
        self.healthcheck = config;
        self
    }

    pub fn with_download_watchdog_config(mut self, config: DownloadWatchdogConfig) -> Self {
        self.download_watchdog = config;
        self
    }

    /// Pin the environment instead of probing the host (tests).
    pub fn with_environment(
        mut self,
        fingerprint: DeviceFingerprint,
        capabilities: Capabilities,
    ) -> Self {
        self.env_override = Some((fingerprint, capabilities));
        self
    }

    pub fn build(self) -> RuntimeResult<Arc<Orchestrator>> {
        let root = self
            .storage_root
            .unwrap_or_else(|| std::env::temp_dir().join("edgerun"));

        let estimator = match (&self.estimator, &self.storage) {
            (Some(estimator), _) => Arc::clone(estimator),
            (None, Some(storage)) => Arc::clone(storage.estimator()),
            (None, None) => {
                Arc::new(DiskQuotaEstimator::new(&root)) as Arc<dyn QuotaEstimator>
            }
        };

        let storage = match self.storage {
            Some(storage) => storage,
            None => {
                let cache = ContentCache::new(root.join("cache")).map_err(RuntimeError::from)?;
                let index = MetadataIndex::open(&root).map_err(RuntimeError::from)?;
                LruCacheManager::new(cache, index, Arc::clone(&estimator))
            }
        };

        let adapters = DashMap::new();
        for adapter in self.adapters {
            adapters.insert(adapter.id(), adapter);
        }

        Ok(Arc::new(Orchestrator {
            state: Arc::new(StateMachine::new(self.config.timeouts.multiplier)),
            config: self.config,
            adapters,
            storage: Arc::new(storage),
            estimator,
            registry: self.registry.unwrap_or_else(crate::registry::global),
            download_lock: self.download_lock.unwrap_or_else(crate::download::shared),
            healthcheck: self.healthcheck,
            download_watchdog: self.download_watchdog,
            env_override: self.env_override,
            epoch: EpochClock::new(),
            pulse: Arc::new(GenerationPulse::new()),
            cancel: Mutex::new(None),
            session: Mutex::new(None),
            selection_report: Mutex::new(None),
            preflight_report: Mutex::new(None),
            recent_errors: Arc::new(Mutex::new(ErrorRing::new())),
            timings: Arc::new(Mutex::new(Timings::default())),
            slo: Mutex::new(SloDiag::default()),
            fingerprint: Mutex::new(None),
            capabilities: Mutex::new(Capabilities::default()),
            cache_diag: Mutex::new(CacheDiag::default()),
            adapter_diag: Mutex::new(AdapterDiag::default()),
            runtime_mode: Mutex::new(RuntimeMode::FullyLocalManaged),
            rehydrate_attempts: AtomicU32::new(0),
        }))
    }
}

/// The client-side inference runtime.
pub struct Orchestrator {
    config: RuntimeConfig,
    adapters: DashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    state: Arc<StateMachine>,
    storage: Arc<LruCacheManager>,
    estimator: Arc<dyn QuotaEstimator>,
    registry: Arc<SharedModelRegistry>,
    download_lock: DownloadLock,
    healthcheck: HealthcheckConfig,
    download_watchdog: DownloadWatchdogConfig,
    env_override: Option<(DeviceFingerprint, Capabilities)>,
    epoch: EpochClock,
    pulse: Arc<GenerationPulse>,
    /// Cancellation token of the in-flight operation (init download or
    /// generation); one at a time by construction.
    cancel: Mutex<Option<CancellationToken>>,
    session: Mutex<Option<ActiveSession>>,
    selection_report: Mutex<Option<SelectionReport>>,
    preflight_report: Mutex<Option<QuotaPreflightReport>>,
    recent_errors: Arc<Mutex<ErrorRing>>,
    timings: Arc<Mutex<Timings>>,
    slo: Mutex<SloDiag>,
    fingerprint: Mutex<Option<DeviceFingerprint>>,
    capabilities: Mutex<Capabilities>,
    cache_diag: Mutex<CacheDiag>,
    adapter_diag: Mutex<AdapterDiag>,
    runtime_mode: Mutex<RuntimeMode>,
    rehydrate_attempts: AtomicU32,
}

impl Orchestrator {
    pub fn builder(config: RuntimeConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Register an additional adapter after construction.
    pub fn register_adapter(&self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.id(), adapter);
    }

    pub fn state(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    pub fn subscribe(&self, listener: StateListener) -> ListenerId {
        self.state.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.state.unsubscribe(id)
    }

    pub fn registry(&self) -> &Arc<SharedModelRegistry> {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<LruCacheManager> {
        &self.storage
    }

    /// Boot the runtime: validate, probe, select, preflight, cache or
    /// download, warm up. Ends in `Ready` or routes to `Error`/`Disabled`.
    pub async fn init(&self) -> RuntimeResult<()> {
        let kind = self.state.kind();
        if kind != StateKind::Idle {
            return Err(RuntimeError::invalid_state("init", kind));
        }
        self.config.validate()?;

        let boot_started = now_epoch_ms();
        self.state
            .transition(RuntimeState::Booting { step: "capture-environment".into() })?;

        let (fingerprint, capabilities) = match &self.env_override {
            Some((fp, caps)) => (fp.clone(), *caps),
            None => {
                let root = self.storage.cache().root().to_path_buf();
                let (fp, caps) = tokio::task::spawn_blocking(move || {
                    (probe::capture_fingerprint(), probe::capture_capabilities(&root))
                })
                .await
                .map_err(|e| RuntimeError::new(ErrorCode::Unknown, e.to_string()))?;
                (fp, caps)
            }
        };
        *self.fingerprint.lock() = Some(fingerprint);
        *self.capabilities.lock() = capabilities;

        match self.boot_pipeline().await {
            Ok(()) => {
                let boot_ms = now_epoch_ms().saturating_sub(boot_started);
                {
                    let mut timings = self.timings.lock();
                    timings.boot_ms = Some(boot_ms);
                }
                self.slo.lock().last_observed_boot_ms = Some(boot_ms);
                self.rehydrate_attempts.store(0, Ordering::SeqCst);
                info!(boot_ms, "runtime ready");
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Selection through warm-up. Entered from `Booting` (init) or
    /// `Rehydrating`.
    async fn boot_pipeline(&self) -> RuntimeResult<()> {
        self.state.transition(RuntimeState::SelectingProvider {
            policy_order: self.config.provider_policy.order.clone(),
            tried: vec![],
        })?;

        let adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>> = self
            .adapters
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        let selection = self
            .with_deadline(async { Ok(select_provider(&self.config, &adapters).await) })
            .await?;

        let report_id = selection.report.id.clone();
        self.state.set_selection_report_id(Some(report_id));
        *self.selection_report.lock() = Some(selection.report.clone());

        let Some(provider) = selection.provider else {
            if selection.all_rejections_by_policy() {
                self.state.transition(RuntimeState::Disabled {
                    reason: "every candidate provider is excluded by policy".into(),
                })?;
            }
            return Err(RuntimeError::new(
                ErrorCode::NativeUnavailable,
                "no provider available",
            )
            .with_details(
                serde_json::to_value(&selection.report).unwrap_or_default(),
            )
            .with_user_action("Update your device or relax the provider policy")
            .at_state(StateKind::SelectingProvider));
        };
        let provider_id = provider.id();
        self.state.set_provider(Some(provider_id));

        let supports = selection
            .outcome
            .as_ref()
            .map(|o| o.supports)
            .unwrap_or_default();
        let claimed_mode = selection.outcome.as_ref().and_then(|o| o.privacy_claim);
        *self.runtime_mode.lock() = claimed_mode.unwrap_or(match provider_id {
            ProviderId::Native => RuntimeMode::BrowserDelegatedUnknown,
            _ => RuntimeMode::FullyLocalManaged,
        });
        *self.adapter_diag.lock() = AdapterDiag {
            message_flattened: !supports.system_role,
            system_prompt_location: if supports.system_role {
                SystemPromptLocation::System
            } else {
                SystemPromptLocation::InlinedFirstUser
            },
        };

        // Model choice and quota fit are resolved in memory before the
        // machine enters PREFLIGHT_QUOTA, so exactly one transition to
        // CHECKING_CACHE follows, however many candidates were weighed.
        let fingerprint = self.fingerprint.lock().clone().expect("set during init");
        let capabilities = *self.capabilities.lock();
        let primary = select_model(provider_id, &fingerprint, &capabilities, &self.config)?;

        let (model, preflight) = if provider_id.uses_sentinel_model() {
            (primary, None)
        } else {
            let mut candidates = vec![primary.clone()];
            let allow_fallback = self
                .config
                .model_policy
                .as_ref()
                .map(|p| p.allow_fallback)
                .unwrap_or(true);
            if allow_fallback {
                candidates.extend(fallback_candidates(provider_id, &primary));
            }
            let (model, report) =
                resolve_with_quota(provider_id, candidates, &self.estimator).await?;
            (model, Some(report))
        };
        *self.preflight_report.lock() = preflight.clone();

        let (required, estimate_supported) = preflight
            .as_ref()
            .and_then(|p| p.attempts.iter().find(|a| a.ok))
            .map(|a| (a.required_bytes, a.estimate_supported))
            .unwrap_or((0, true));
        self.state.transition(RuntimeState::PreflightQuota {
            model_id: model.id.clone(),
            required_bytes: required,
            estimate_supported,
        })?;

        self.state.transition(RuntimeState::CheckingCache {
            model_id: model.id.clone(),
            cache_hit: None,
        })?;

        let cache_hit = if provider_id.uses_sentinel_model() {
            // Sentinel providers bring their own weights.
            true
        } else {
            let repair = auto_repair(self.storage.cache(), self.storage.index(), &model.id);
            self.cache_diag.lock().last_auto_repair_result = Some(repair);
            if repair == RepairOutcome::Repaired {
                self.recent_errors.lock().push(
                    RuntimeError::new(
                        ErrorCode::CacheDesyncRepaired,
                        format!("cache and metadata disagreed for {}; desynchronized side purged", model.id),
                    )
                    .with_recoverability(edgerun_kernel::error::Recoverability::Recoverable)
                    .at_state(StateKind::CheckingCache),
                );
            }
            self.storage.cache().has_model(&model.id) && self.storage.index().contains(&model.id)
        };
        self.state.amend(|state| {
            if let RuntimeState::CheckingCache { cache_hit: slot, .. } = state {
                *slot = Some(cache_hit);
            }
        });
        {
            let mut cache_diag = self.cache_diag.lock();
            cache_diag.model_id = Some(model.id.clone());
            cache_diag.cache_hit = Some(cache_hit);
        }

        if cache_hit {
            if !provider_id.uses_sentinel_model() {
                self.storage.touch_model(&model.id).map_err(RuntimeError::from)?;
            }
            self.state
                .transition(RuntimeState::WarmingUp { phase: "load-from-cache".into() })?;
            let warmup_started = now_epoch_ms();
            let hooks = self.init_hooks(None);
            self.with_deadline(provider.init(&self.config, Some(&model), hooks))
                .await?;
            self.timings.lock().warmup_ms =
                Some(now_epoch_ms().saturating_sub(warmup_started));
        } else {
            self.download_and_warm(&provider, &model, supports).await?;
        }

        if !provider_id.uses_sentinel_model() {
            self.storage.pin_model(&model.id);
        }
        *self.session.lock() = Some(ActiveSession { provider, model: model.clone() });
        self.state.transition(RuntimeState::Ready { model_id: model.id })?;
        Ok(())
    }

    async fn download_and_warm(
        &self,
        provider: &Arc<dyn ProviderAdapter>,
        model: &ModelSpec,
        supports: ProviderSupports,
    ) -> RuntimeResult<()> {
        // Best effort: bring usage under the ceiling before adding bytes.
        if let Ok(evicted) = self.storage.auto_evict().await {
            if !evicted.is_empty() {
                info!(count = evicted.len(), "evicted stale models before download");
            }
        }

        let variant = if supports.download_progress {
            DownloadVariant::Determinate
        } else {
            DownloadVariant::Indeterminate
        };
        self.state.transition(RuntimeState::Downloading {
            variant,
            total_bytes: None,
            downloaded_bytes: 0,
            last_progress_at_ms: 0,
        })?;

        // One model download at a time across the process.
        let _download_slot = self.download_lock.acquire().await;

        let init_cancel = CancellationToken::new();
        *self.cancel.lock() = Some(init_cancel.clone());

        let watchdog = {
            let ring = Arc::clone(&self.recent_errors);
            let state = Arc::clone(&self.state);
            let cancel = init_cancel.clone();
            let provider_id = provider.id();
            spawn_download_watchdog(self.download_watchdog, Arc::clone(&self.state), move || {
                let error = RuntimeError::new(
                    ErrorCode::NativeDownloadStuck,
                    "download made no progress for the silence window",
                )
                .with_user_action("Check your connection and retry")
                .at_state(StateKind::Downloading)
                .at_provider(provider_id);
                ring.lock().push(error.clone());
                let _ = state.transition(RuntimeState::Error {
                    error,
                    can_rehydrate: true,
                });
                cancel.cancel();
            })
        };

        let progress_state = Arc::clone(&self.state);
        let hooks = InitHooks {
            on_progress: Some(Arc::new(move |progress| {
                progress_state.amend(|state| {
                    if let RuntimeState::Downloading {
                        downloaded_bytes,
                        total_bytes,
                        last_progress_at_ms,
                        ..
                    } = state
                    {
                        if let Some(bytes) = progress.downloaded_bytes {
                            // Byte counts are monotone by contract.
                            *downloaded_bytes = (*downloaded_bytes).max(bytes);
                        }
                        if progress.total_bytes.is_some() {
                            *total_bytes = progress.total_bytes;
                        }
                        *last_progress_at_ms = now_epoch_ms();
                    }
                });
            })),
            on_recreate: self.recreate_hook(),
            cancel: Some(init_cancel.clone()),
        };

        let download_started = now_epoch_ms();
        let result = self
            .with_deadline(provider.init(&self.config, Some(model), hooks))
            .await;
        watchdog.stop();
        *self.cancel.lock() = None;

        if let Err(err) = result {
            // The stuck watchdog may have already parked us in ERROR; its
            // error is the authoritative one.
            if let RuntimeState::Error { error, .. } = self.state.snapshot().state {
                return Err(error);
            }
            return Err(err);
        }
        self.timings.lock().download_ms =
            Some(now_epoch_ms().saturating_sub(download_started));

        // Record the artifact so the next boot is a cache hit: manifest
        // blob into the content cache, authoritative record into the index.
        let manifest = serde_json::to_vec(model).map_err(|e| {
            RuntimeError::new(ErrorCode::Unknown, format!("manifest encode failed: {e}"))
        })?;
        self.storage
            .cache()
            .insert(&model.id, "manifest.json", &manifest)
            .map_err(RuntimeError::from)?;
        let mut record = ModelRecord::new(&model.id, model.size_bytes);
        if let Some(integrity) = &model.integrity {
            record = record.with_checksum(integrity.clone());
        }
        self.storage.index().put(record).map_err(RuntimeError::from)?;

        let warmup_started = now_epoch_ms();
        self.state
            .transition(RuntimeState::WarmingUp { phase: "finalize".into() })?;
        self.timings.lock().warmup_ms = Some(now_epoch_ms().saturating_sub(warmup_started));
        Ok(())
    }

    fn init_hooks(&self, cancel: Option<CancellationToken>) -> InitHooks {
        InitHooks {
            on_progress: None,
            on_recreate: self.recreate_hook(),
            cancel,
        }
    }

    /// Hook a provider fires after rebuilding its engine mid-request; the
    /// rebuild must not count as token silence.
    fn recreate_hook(&self) -> Option<edgerun_kernel::provider::RecreateHook> {
        let pulse = Arc::clone(&self.pulse);
        let state = Arc::clone(&self.state);
        Some(Arc::new(move || {
            debug!("engine recreated, resetting generation timer");
            pulse.restart();
            state.amend(|s| {
                if let RuntimeState::Generating { last_token_at_ms, .. } = s {
                    *last_token_at_ms = 0;
                }
            });
        }))
    }

    /// Run one generation to completion, forwarding stamped events to
    /// `sink` when provided.
    pub async fn generate(&self, params: GenerateParams) -> RuntimeResult<GenerateResult> {
        self.run_generate(params, None).await
    }

    /// Streaming variant: events arrive as an async sequence terminated
    /// by `final` (or `aborted`); the join handle resolves to the result.
    pub fn generate_stream(
        self: &Arc<Self>,
        params: GenerateParams,
    ) -> RuntimeResult<GenerationStream> {
        // Validation failures surface synchronously, before any task or
        // state transition exists.
        self.validate_params(&params)?;

        let (tx, rx) = tokio::sync::mpsc::channel::<GenerationEvent>(64);
        let sink: EventSink = Arc::new(move |event| {
            let _ = tx.try_send(event);
        });

        let orchestrator = Arc::clone(self);
        let result = tokio::spawn(async move {
            orchestrator.run_generate_validated(params, Some(sink)).await
        });

        Ok(GenerationStream { events: ReceiverStream::new(rx), result })
    }

    fn validate_params(&self, params: &GenerateParams) -> RuntimeResult<()> {
        if !self.state.can_generate() {
            return Err(RuntimeError::invalid_state("generate", self.state.kind()));
        }
        if params.messages.is_empty() {
            return Err(RuntimeError::new(
                ErrorCode::InvalidInputEmptyMessages,
                "messages must not be empty",
            ));
        }
        if params.max_tokens == 0 {
            return Err(RuntimeError::new(
                ErrorCode::InvalidConfig,
                "maxTokens must be greater than zero",
            ));
        }
        Ok(())
    }

    fn clamp_params(params: &mut GenerateParams) {
        if let Some(t) = params.temperature {
            params.temperature = Some(t.clamp(0.0, 2.0));
        }
        if let Some(p) = params.top_p {
            params.top_p = Some(p.clamp(0.0, 1.0));
        }
    }

    async fn run_generate(
        &self,
        params: GenerateParams,
        sink: Option<EventSink>,
    ) -> RuntimeResult<GenerateResult> {
        self.validate_params(&params)?;
        self.run_generate_validated(params, sink).await
    }

    async fn run_generate_validated(
        &self,
        mut params: GenerateParams,
        sink: Option<EventSink>,
    ) -> RuntimeResult<GenerateResult> {
        Self::clamp_params(&mut params);

        let session = self
            .session
            .lock()
            .clone()
            .ok_or_else(|| RuntimeError::invalid_state("generate", self.state.kind()))?;

        let epoch = self.epoch.next_epoch();
        self.state.transition(RuntimeState::Generating {
            epoch,
            request_seq: 0,
            is_aborting: false,
            tokens_emitted: 0,
            last_token_at_ms: 0,
        })?;

        let stamper = Arc::new(EnvelopeStamper::new(epoch));
        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());
        self.pulse.restart();
        let started = now_epoch_ms();
        let model_id = session.model.id.clone();

        let healthcheck = {
            let ring = Arc::clone(&self.recent_errors);
            let state = Arc::clone(&self.state);
            let cancel = cancel.clone();
            let provider = Arc::clone(&session.provider);
            let provider_id = provider.id();
            let model_id = model_id.clone();
            spawn_healthcheck(
                self.healthcheck,
                Arc::clone(&self.pulse),
                Arc::clone(&self.state),
                move || {
                    ring.lock().push(
                        RuntimeError::new(
                            ErrorCode::HealthcheckTimeoutDuringGeneration,
                            "generation went token-silent past the healthcheck budget",
                        )
                        .at_state(StateKind::Generating)
                        .at_provider(provider_id),
                    );
                    cancel.cancel();
                    let provider = Arc::clone(&provider);
                    tokio::spawn(async move { provider.abort().await });
                    // Back to READY, not ERROR: the next generate can
                    // start immediately.
                    if state.kind() == StateKind::Generating {
                        let _ = state
                            .transition(RuntimeState::Ready { model_id: model_id.clone() });
                    }
                },
            )
        };

        let token_sink: TokenSink = {
            let pulse = Arc::clone(&self.pulse);
            let state = Arc::clone(&self.state);
            let stamper = Arc::clone(&stamper);
            let cancel = cancel.clone();
            let sink = sink.clone();
            let timings = Arc::clone(&self.timings);
            let first_token = AtomicBool::new(false);
            Arc::new(move |token: &str| {
                if cancel.is_cancelled() {
                    return;
                }
                pulse.record_token();
                let envelope = stamper.stamp();
                if !first_token.swap(true, Ordering::SeqCst) {
                    timings.lock().first_token_ms =
                        Some(now_epoch_ms().saturating_sub(started));
                }
                state.amend(|s| {
                    if let RuntimeState::Generating {
                        tokens_emitted,
                        last_token_at_ms,
                        request_seq,
                        ..
                    } = s
                    {
                        *tokens_emitted += 1;
                        *last_token_at_ms = now_epoch_ms();
                        *request_seq = envelope.seq;
                    }
                });
                if let Some(sink) = &sink {
                    sink(GenerationEvent::token(token, envelope));
                }
            })
        };

        let mut budget = RetryBudget::new(params.max_tokens);
        let outcome = loop {
            params.max_tokens = budget.max_tokens();
            match session
                .provider
                .generate(params.clone(), Arc::clone(&token_sink), cancel.clone())
                .await
            {
                Ok(response) => break Ok(response),
                Err(err) if err.code == ErrorCode::PromptBudgetOverflow => {
                    match budget.prepare_retry(err) {
                        Ok(granted) => {
                            warn!(
                                granted,
                                attempt = budget.attempt(),
                                "prompt too large, retrying with reduced budget"
                            );
                            self.pulse.restart();
                        }
                        Err(exhausted) => break Err(exhausted),
                    }
                }
                Err(err) => break Err(err),
            }
        };

        healthcheck.stop();
        *self.cancel.lock() = None;

        match outcome {
            Ok(response) => {
                let elapsed_ms = now_epoch_ms().saturating_sub(started);
                {
                    let mut timings = self.timings.lock();
                    let tokens = self.pulse.tokens_emitted();
                    if elapsed_ms > 0 && tokens > 0 {
                        timings.tokens_per_second =
                            Some(tokens as f64 / (elapsed_ms as f64 / 1000.0));
                    }
                }
                let envelope = stamper.stamp();
                if let Some(sink) = &sink {
                    sink(GenerationEvent::final_event(
                        response.text.clone(),
                        response.usage,
                        envelope,
                    ));
                }
                self.return_to_ready(epoch, &model_id);
                Ok(GenerateResult {
                    text: response.text,
                    usage: response.usage,
                    provider_id: response.provider_id,
                    model_id: response.model_id,
                    selection_report_id: self.state.snapshot().selection_report_id,
                })
            }
            Err(err) if err.code == ErrorCode::Aborted || cancel.is_cancelled() => {
                debug!(code = %err.code, epoch, "generation cancelled");
                if let Some(sink) = &sink {
                    sink(GenerationEvent::aborted(stamper.stamp()));
                }
                self.return_to_ready(epoch, &model_id);
                Err(RuntimeError::aborted().at_provider(session.provider.id()))
            }
            Err(err) => {
                if let Some(sink) = &sink {
                    sink(GenerationEvent::aborted(stamper.stamp()));
                }
                Err(self.fail(err.at_state(StateKind::Generating)))
            }
        }
    }

    /// Transition back to `Ready` if this epoch's generation still owns
    /// the machine; abort or the watchdog may have moved it first.
    fn return_to_ready(&self, epoch: u64, model_id: &str) {
        let snapshot = self.state.snapshot();
        if let RuntimeState::Generating { epoch: current, .. } = snapshot.state {
            if current == epoch {
                let _ = self
                    .state
                    .transition(RuntimeState::Ready { model_id: model_id.to_string() });
            }
        }
    }

    /// Abort the in-flight generation or download. Idempotent; safe in
    /// any state.
    pub async fn abort(&self) {
        let abort_started = now_epoch_ms();
        match self.state.kind() {
            StateKind::Generating => {
                self.state.amend(|s| {
                    if let RuntimeState::Generating { is_aborting, .. } = s {
                        *is_aborting = true;
                    }
                });
                let cancel = self.cancel.lock().clone();
                if let Some(cancel) = cancel {
                    cancel.cancel();
                }
                let session = self.session.lock().clone();
                if let Some(session) = session {
                    session.provider.abort().await;
                    // Same-tick return to READY; the generation task will
                    // observe the moved state and skip its own transition.
                    self.return_to_ready_current(&session.model.id);
                }
                self.slo.lock().last_observed_abort_ms =
                    Some(now_epoch_ms().saturating_sub(abort_started));
            }
            StateKind::Downloading => {
                let cancel = self.cancel.lock().clone();
                if let Some(cancel) = cancel {
                    cancel.cancel();
                }
                let session_provider = self.current_provider();
                if let Some(provider) = session_provider {
                    provider.abort().await;
                }
            }
            _ => {
                debug!(state = %self.state.kind(), "abort is a no-op in this state");
            }
        }
    }

    fn return_to_ready_current(&self, model_id: &str) {
        if self.state.kind() == StateKind::Generating {
            let _ = self
                .state
                .transition(RuntimeState::Ready { model_id: model_id.to_string() });
        }
    }

    fn current_provider(&self) -> Option<Arc<dyn ProviderAdapter>> {
        if let Some(session) = self.session.lock().as_ref() {
            return Some(Arc::clone(&session.provider));
        }
        let provider_id = self.state.snapshot().provider_id?;
        self.adapters.get(&provider_id).map(|a| Arc::clone(a.value()))
    }

    /// Bounded re-entry from a recoverable error back through provider
    /// selection.
    pub async fn rehydrate(&self) -> RuntimeResult<()> {
        let snapshot = self.state.snapshot();
        let RuntimeState::Error { error, can_rehydrate } = snapshot.state else {
            return Err(RuntimeError::invalid_state("rehydrate", snapshot.kind()));
        };
        if !can_rehydrate {
            return Err(RuntimeError::invalid_state("rehydrate", StateKind::Error)
                .with_cause(format!("{} is not recoverable", error.code)));
        }

        let attempt = self.rehydrate_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > MAX_REHYDRATE_ATTEMPTS {
            let exhausted = RuntimeError::new(
                ErrorCode::Unknown,
                format!("rehydration budget exhausted after {MAX_REHYDRATE_ATTEMPTS} attempts"),
            )
            .with_recoverability(edgerun_kernel::error::Recoverability::NonRecoverable)
            .with_cause(error.to_string());
            return Err(self.fail(exhausted));
        }

        info!(attempt, from = %error.code, "rehydrating");
        self.state.transition(RuntimeState::Rehydrating {
            reason: error.code.to_string(),
            attempt,
        })?;

        // Tear down the old session before re-selecting.
        let old = self.session.lock().take();
        if let Some(session) = old {
            session.provider.teardown().await;
            self.storage.unpin_model(&session.model.id);
        }

        match self.boot_pipeline().await {
            Ok(()) => {
                self.rehydrate_attempts.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Release the provider and return to `Idle`. Idempotent: calling it
    /// from `Idle` (including twice in a row) succeeds without effect.
    pub async fn teardown(&self) -> RuntimeResult<()> {
        if self.state.kind() == StateKind::Idle {
            return Ok(());
        }
        self.state
            .transition(RuntimeState::TearingDown { reason: "teardown requested".into() })?;

        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.provider.teardown().await;
            self.storage.unpin_model(&session.model.id);
        }
        *self.selection_report.lock() = None;
        *self.preflight_report.lock() = None;
        self.state.set_provider(None);
        self.state.set_selection_report_id(None);

        self.state.transition(RuntimeState::Idle)?;
        info!("runtime torn down");
        Ok(())
    }

    /// The aggregated snapshot.
    pub async fn diagnostics(&self) -> DiagnosticsSnapshot {
        let estimate = self.estimator.estimate().await.ok();
        let storage = estimate
            .map(|e| StorageDiag {
                supported: e.supported,
                quota_bytes: e.quota_bytes,
                usage_bytes: e.usage_bytes,
                available_bytes: e.available_bytes(),
            })
            .unwrap_or_default();

        let state = self.state.snapshot();
        let mut timings = *self.timings.lock();
        timings.last_state_change_at_ms = state.since_ms;

        DiagnosticsSnapshot {
            schema_version: DIAGNOSTICS_SCHEMA_VERSION.into(),
            generated_at_ms: now_epoch_ms(),
            lib_version: env!("CARGO_PKG_VERSION").into(),
            selection_report: self.selection_report.lock().clone(),
            quota_preflight_report: self.preflight_report.lock().clone(),
            state,
            privacy: PrivacyDiag {
                privacy_mode: self.config.privacy_mode,
                runtime_mode: *self.runtime_mode.lock(),
                note: match self.config.privacy_mode {
                    PrivacyMode::FullyLocalManaged => {
                        "all inference runs locally under runtime management".into()
                    }
                    PrivacyMode::Any => {
                        "provider locality follows the selected backend's claim".into()
                    }
                },
            },
            env: self.fingerprint.lock().clone(),
            capabilities: *self.capabilities.lock(),
            storage,
            cache: self.cache_diag.lock().clone(),
            timings,
            slo: *self.slo.lock(),
            adapters: *self.adapter_diag.lock(),
            recent_errors: self.recent_errors.lock().to_vec(),
        }
    }

    /// Route a failure into `Error` and record it. When the machine is
    /// already parked in `Error` or `Disabled`, whoever parked it (e.g. a
    /// watchdog) recorded the failure; nothing is overwritten.
    fn fail(&self, err: RuntimeError) -> RuntimeError {
        let err = if err.at_state.is_none() {
            err.at_state(self.state.kind())
        } else {
            err
        };
        let kind = self.state.kind();
        if kind != StateKind::Error && kind != StateKind::Disabled {
            self.recent_errors.lock().push(err.clone());
            let _ = self.state.transition(RuntimeState::Error {
                error: err.clone(),
                can_rehydrate: err.is_recoverable(),
            });
        }
        err
    }

    /// Deadline-bound execution of one phase, per the current state's
    /// deadline. States without one run unbounded.
    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = RuntimeResult<T>>,
    ) -> RuntimeResult<T> {
        let snapshot = self.state.snapshot();
        match snapshot.deadline_ms {
            Some(deadline_ms) => {
                match tokio::time::timeout(Duration::from_millis(deadline_ms), fut).await {
                    Ok(result) => result,
                    Err(_) => Err(RuntimeError::timeout(snapshot.kind(), deadline_ms)),
                }
            }
            None => fut.await,
        }
    }
}
