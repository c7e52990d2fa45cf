//! Deterministic mock provider.
//!
//! The canonical test double for lifecycle and generation tests, and the
//! backing for the `mock` entry of the provider enumeration. Behavior is
//! scripted at build time and every call is recorded:
//!
//! | Goal | Mechanism |
//! |------|-----------|
//! | Deterministic | responses queued at build time, FIFO |
//! | Observable | `detect_calls()`, `abort_calls()`, `last_generate_params()`, … |
//! | Cancellation-faithful | token loop checks the request token between emits |
//! | Corruption-faithful | abort mid-stream flags an engine rebuild; the next `generate` fires the recreate hook |

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use edgerun_kernel::config::RuntimeConfig;
use edgerun_kernel::error::{RuntimeError, RuntimeResult};
use edgerun_kernel::model::ModelSpec;
use edgerun_kernel::provider::{
    DetectOutcome, DownloadProgress, GenerateParams, InitHooks, ProviderAdapter, ProviderId,
    ProviderResponse, ProviderSupports, RecreateHook, RuntimeMode, TokenSink, TokenUsage,
};

/// Scripted download behavior for `init`.
#[derive(Debug, Clone)]
pub struct SimulatedDownload {
    pub total_bytes: u64,
    pub chunks: u32,
    pub chunk_delay: Duration,
}

struct MockState {
    detect_queue: VecDeque<RuntimeResult<DetectOutcome>>,
    response_queue: VecDeque<RuntimeResult<String>>,
    generate_params: Vec<GenerateParams>,
    recreate_hook: Option<RecreateHook>,
    init_models: Vec<Option<String>>,
}

/// The mock adapter. Thread-safe; wrap in `Arc` and share freely.
pub struct MockProvider {
    id: ProviderId,
    supports: ProviderSupports,
    privacy_claim: RuntimeMode,
    token_delay: Duration,
    download: Option<SimulatedDownload>,
    hang_init_until_cancel: bool,
    state: Mutex<MockState>,
    detect_count: AtomicU32,
    init_count: AtomicU32,
    generate_count: AtomicU32,
    abort_count: AtomicU32,
    teardown_count: AtomicU32,
    generating: AtomicBool,
    needs_recreate: AtomicBool,
}

impl MockProvider {
    pub fn builder() -> MockProviderBuilder {
        MockProviderBuilder::default()
    }

    pub fn detect_calls(&self) -> u32 {
        self.detect_count.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> u32 {
        self.init_count.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> u32 {
        self.generate_count.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> u32 {
        self.abort_count.load(Ordering::SeqCst)
    }

    pub fn teardown_calls(&self) -> u32 {
        self.teardown_count.load(Ordering::SeqCst)
    }

    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate.load(Ordering::SeqCst)
    }

    pub fn last_generate_params(&self) -> Option<GenerateParams> {
        self.state.lock().generate_params.last().cloned()
    }

    pub fn init_model_ids(&self) -> Vec<Option<String>> {
        self.state.lock().init_models.clone()
    }

    async fn run_download(&self, hooks: &InitHooks) -> RuntimeResult<()> {
        let Some(download) = &self.download else {
            return Ok(());
        };
        let chunk = download.total_bytes / download.chunks.max(1) as u64;
        let mut downloaded = 0;
        for i in 0..download.chunks {
            if let Some(cancel) = &hooks.cancel {
                if cancel.is_cancelled() {
                    return Err(RuntimeError::aborted());
                }
            }
            tokio::time::sleep(download.chunk_delay).await;
            downloaded = if i + 1 == download.chunks {
                download.total_bytes
            } else {
                downloaded + chunk
            };
            if let Some(on_progress) = &hooks.on_progress {
                on_progress(DownloadProgress {
                    downloaded_bytes: Some(downloaded),
                    total_bytes: Some(download.total_bytes),
                    percent: Some(downloaded as f32 / download.total_bytes.max(1) as f32 * 100.0),
                    text: None,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn detect(&self, _config: &RuntimeConfig) -> RuntimeResult<DetectOutcome> {
        self.detect_count.fetch_add(1, Ordering::SeqCst);
        let scripted = self.state.lock().detect_queue.pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => Ok(DetectOutcome::available(self.supports)
                .with_privacy_claim(self.privacy_claim)),
        }
    }

    async fn init(
        &self,
        _config: &RuntimeConfig,
        model: Option<&ModelSpec>,
        hooks: InitHooks,
    ) -> RuntimeResult<()> {
        self.init_count.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock();
            state.init_models.push(model.map(|m| m.id.clone()));
            state.recreate_hook = hooks.on_recreate.clone();
        }

        if self.hang_init_until_cancel {
            // No progress heartbeats: exactly the shape the stuck-download
            // watchdog exists for.
            match &hooks.cancel {
                Some(cancel) => {
                    cancel.cancelled().await;
                    return Err(RuntimeError::aborted());
                }
                None => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return Err(RuntimeError::aborted());
                }
            }
        }

        self.run_download(&hooks).await?;
        debug!(provider = %self.id, "mock engine initialized");
        Ok(())
    }

    async fn generate(
        &self,
        params: GenerateParams,
        on_token: TokenSink,
        cancel: CancellationToken,
    ) -> RuntimeResult<ProviderResponse> {
        self.generate_count.fetch_add(1, Ordering::SeqCst);
        let scripted = {
            let mut state = self.state.lock();
            state.generate_params.push(params.clone());
            state.response_queue.pop_front()
        };

        // A previous abort corrupted the engine: rebuild from the cached
        // init config, then tell the orchestrator so the generation timer
        // restarts without billing the rebuild as silence.
        if self.needs_recreate.swap(false, Ordering::SeqCst) {
            debug!(provider = %self.id, "rebuilding mock engine after abort corruption");
            tokio::time::sleep(Duration::from_millis(1)).await;
            let hook = self.state.lock().recreate_hook.clone();
            if let Some(hook) = hook {
                hook();
            }
        }

        let text = match scripted {
            Some(Ok(text)) => text,
            Some(Err(err)) => return Err(err),
            None => "Hello from the mock engine, a fine local model indeed.".to_string(),
        };

        self.generating.store(true, Ordering::SeqCst);
        let result = async {
            let mut emitted: Vec<&str> = Vec::new();
            for token in text.split_whitespace().take(params.max_tokens as usize) {
                if cancel.is_cancelled() {
                    return Err(RuntimeError::aborted());
                }
                if !self.token_delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RuntimeError::aborted()),
                        _ = tokio::time::sleep(self.token_delay) => {}
                    }
                }
                on_token(token);
                emitted.push(token);
            }
            let completion = emitted.len() as u32;
            Ok(ProviderResponse {
                text: emitted.join(" "),
                usage: Some(TokenUsage {
                    prompt_tokens: params
                        .messages
                        .iter()
                        .map(|m| m.content.split_whitespace().count() as u32)
                        .sum(),
                    completion_tokens: completion,
                    total_tokens: 0,
                })
                .map(|mut u| {
                    u.total_tokens = u.prompt_tokens + u.completion_tokens;
                    u
                }),
                provider_id: self.id,
                model_id: self.state.lock().init_models.last().cloned().flatten(),
            })
        }
        .await;
        self.generating.store(false, Ordering::SeqCst);
        result
    }

    async fn abort(&self) {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        // A mid-stream abort leaves this engine corrupted; the rebuild
        // happens lazily on the next generate.
        if self.generating.load(Ordering::SeqCst) {
            self.needs_recreate.store(true, Ordering::SeqCst);
        }
    }

    async fn teardown(&self) {
        self.teardown_count.fetch_add(1, Ordering::SeqCst);
        self.generating.store(false, Ordering::SeqCst);
    }
}

/// Builder; responses and detect outcomes queue FIFO.
pub struct MockProviderBuilder {
    id: ProviderId,
    supports: ProviderSupports,
    privacy_claim: RuntimeMode,
    token_delay: Duration,
    download: Option<SimulatedDownload>,
    hang_init_until_cancel: bool,
    detect_queue: VecDeque<RuntimeResult<DetectOutcome>>,
    response_queue: VecDeque<RuntimeResult<String>>,
}

impl Default for MockProviderBuilder {
    fn default() -> Self {
        Self {
            id: ProviderId::Mock,
            supports: ProviderSupports {
                streaming: true,
                abort: true,
                system_role: true,
                download_progress: false,
            },
            privacy_claim: RuntimeMode::FullyLocalManaged,
            token_delay: Duration::ZERO,
            download: None,
            hang_init_until_cancel: false,
            detect_queue: VecDeque::new(),
            response_queue: VecDeque::new(),
        }
    }
}

impl MockProviderBuilder {
    /// Masquerade as another provider id (selection tests).
    pub fn with_id(mut self, id: ProviderId) -> Self {
        self.id = id;
        self
    }

    pub fn with_supports(mut self, supports: ProviderSupports) -> Self {
        self.supports = supports;
        self
    }

    pub fn with_privacy_claim(mut self, claim: RuntimeMode) -> Self {
        self.privacy_claim = claim;
        self
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Simulate a determinate download during init.
    pub fn with_download(mut self, download: SimulatedDownload) -> Self {
        self.download = Some(download);
        self
    }

    /// Make init hang with no progress until cancelled.
    pub fn hang_init_until_cancel(mut self) -> Self {
        self.hang_init_until_cancel = true;
        self
    }

    /// Queue one scripted detect outcome.
    pub fn detect_with(mut self, outcome: DetectOutcome) -> Self {
        self.detect_queue.push_back(Ok(outcome));
        self
    }

    pub fn detect_unavailable(mut self, reason: impl Into<String>) -> Self {
        self.detect_queue
            .push_back(Ok(DetectOutcome::unavailable(reason)));
        self
    }

    pub fn detect_error(mut self, error: RuntimeError) -> Self {
        self.detect_queue.push_back(Err(error));
        self
    }

    /// Queue one generation response.
    pub fn respond_with(mut self, text: impl Into<String>) -> Self {
        self.response_queue.push_back(Ok(text.into()));
        self
    }

    pub fn respond_with_error(mut self, error: RuntimeError) -> Self {
        self.response_queue.push_back(Err(error));
        self
    }

    pub fn build(self) -> Arc<MockProvider> {
        Arc::new(MockProvider {
            id: self.id,
            supports: self.supports,
            privacy_claim: self.privacy_claim,
            token_delay: self.token_delay,
            download: self.download,
            hang_init_until_cancel: self.hang_init_until_cancel,
            state: Mutex::new(MockState {
                detect_queue: self.detect_queue,
                response_queue: self.response_queue,
                generate_params: Vec::new(),
                recreate_hook: None,
                init_models: Vec::new(),
            }),
            detect_count: AtomicU32::new(0),
            init_count: AtomicU32::new(0),
            generate_count: AtomicU32::new(0),
            abort_count: AtomicU32::new(0),
            teardown_count: AtomicU32::new(0),
            generating: AtomicBool::new(false),
            needs_recreate: AtomicBool::new(false),
        })
    }
}
