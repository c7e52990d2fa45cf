//! Shared model registry.
//!
//! One process-wide table of loaded model instances, shared by the core
//! text-generation provider and auxiliary consumers (audio, OCR,
//! embeddings, vision) so large weights are never loaded twice. Entries
//! are ref-counted: while `ref_count > 0` a model is ineligible for LRU
//! eviction and its idle timer is unarmed. Concurrent `acquire` calls for
//! the same id are deduplicated — the loader runs exactly once.
//!
//! A lazily-created global instance exists for convenience, but the
//! orchestrator takes the registry by injection so tests stay hermetic.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use edgerun_kernel::error::RuntimeResult;
use edgerun_kernel::now_epoch_ms;

/// Default idle timeout before an unreferenced model unloads: 5 minutes.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Default memory budget across all loaded instances.
pub const DEFAULT_MAX_MEMORY_MB: u64 = 8 * 1024;

/// Which subsystem a registered model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelBackendKind {
    TextGeneration,
    Embeddings,
    Audio,
    Ocr,
    Vision,
    Mock,
}

impl ModelBackendKind {
    /// Eviction priority; lower evicts first when last-used timestamps
    /// tie. Auxiliary models go before the core text engine.
    pub fn eviction_priority(&self) -> u8 {
        match self {
            ModelBackendKind::Mock => 0,
            ModelBackendKind::Ocr => 1,
            ModelBackendKind::Vision => 1,
            ModelBackendKind::Audio => 2,
            ModelBackendKind::Embeddings => 3,
            ModelBackendKind::TextGeneration => 4,
        }
    }
}

/// A loaded model instance. `dispose` is the teardown hook the registry
/// invokes on unload; implementations release engine memory there.
pub trait ModelInstance: Send + Sync {
    fn dispose(&self) {}
}

/// Options for [`SharedModelRegistry::acquire`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    pub size_estimate_mb: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

/// Registry tuning.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub max_memory_mb: u64,
    pub default_idle_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: DEFAULT_MAX_MEMORY_MB,
            default_idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

struct Entry {
    backend: ModelBackendKind,
    instance: Arc<dyn ModelInstance>,
    size_estimate_mb: u64,
    ref_count: u32,
    loaded_at_ms: u64,
    last_used_at_ms: u64,
    idle_timeout_ms: u64,
    /// Bumped on every acquire/release; a pending idle timer only fires
    /// when its captured generation still matches.
    idle_generation: u64,
    insertion_seq: u64,
}

/// Observable entry state, without the instance.
#[derive(Debug, Clone)]
pub struct ModelEntryInfo {
    pub id: String,
    pub backend: ModelBackendKind,
    pub size_estimate_mb: u64,
    pub ref_count: u32,
    pub loaded_at_ms: u64,
    pub last_used_at_ms: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    insertion_counter: u64,
}

/// The registry proper.
pub struct SharedModelRegistry {
    config: RegistryConfig,
    inner: Mutex<Inner>,
    load_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SharedModelRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner::default()),
            load_guards: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(RegistryConfig::default())
    }

    /// Acquire a reference to `id`, loading it on first use.
    ///
    /// The loader is invoked at most once per load, no matter how many
    /// callers race on the same id; losers of the race wait and then share
    /// the winner's instance.
    pub async fn acquire<F>(
        self: &Arc<Self>,
        id: &str,
        backend: ModelBackendKind,
        loader: F,
        options: AcquireOptions,
    ) -> RuntimeResult<Arc<dyn ModelInstance>>
    where
        F: FnOnce() -> BoxFuture<'static, RuntimeResult<Arc<dyn ModelInstance>>>,
    {
        if let Some(instance) = self.try_reuse(id) {
            return Ok(instance);
        }

        // Per-id async guard: one loader in flight per model.
        let guard = {
            let mut guards = self.load_guards.lock();
            Arc::clone(
                guards
                    .entry(id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let _held = guard.lock().await;

        // A racer may have finished loading while we waited on the guard.
        if let Some(instance) = self.try_reuse(id) {
            return Ok(instance);
        }

        let size_mb = options.size_estimate_mb.unwrap_or(0);
        self.evict_for_budget(size_mb);

        debug!(model_id = id, ?backend, "loading model into registry");
        let instance = loader().await?;

        {
            let mut inner = self.inner.lock();
            let now = now_epoch_ms();
            inner.insertion_counter += 1;
            let seq = inner.insertion_counter;
            inner.entries.insert(
                id.to_string(),
                Entry {
                    backend,
                    instance: Arc::clone(&instance),
                    size_estimate_mb: size_mb,
                    ref_count: 1,
                    loaded_at_ms: now,
                    last_used_at_ms: now,
                    idle_timeout_ms: options
                        .idle_timeout_ms
                        .unwrap_or(self.config.default_idle_timeout_ms),
                    idle_generation: 0,
                    insertion_seq: seq,
                },
            );
        }
        info!(model_id = id, size_mb, "model registered");
        Ok(instance)
    }

    fn try_reuse(&self, id: &str) -> Option<Arc<dyn ModelInstance>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(id)?;
        entry.ref_count += 1;
        entry.last_used_at_ms = now_epoch_ms();
        // Disarm any pending idle timer.
        entry.idle_generation += 1;
        debug!(model_id = id, ref_count = entry.ref_count, "model reference reused");
        Some(Arc::clone(&entry.instance))
    }

    /// Drop one reference. At zero the idle timer arms; when it fires and
    /// the model is still unreferenced, it unloads.
    pub fn release(self: &Arc<Self>, id: &str) {
        let armed = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.entries.get_mut(id) else {
                warn!(model_id = id, "release for unknown model");
                return;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.last_used_at_ms = now_epoch_ms();
            entry.idle_generation += 1;
            if entry.ref_count == 0 {
                Some((entry.idle_generation, entry.idle_timeout_ms))
            } else {
                None
            }
        };

        if let Some((generation, timeout_ms)) = armed {
            let registry = Arc::clone(self);
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
                registry.idle_fire(&id, generation);
            });
        }
    }

    fn idle_fire(self: &Arc<Self>, id: &str, generation: u64) {
        let victim = {
            let mut inner = self.inner.lock();
            let still_idle = matches!(
                inner.entries.get(id),
                Some(entry) if entry.ref_count == 0 && entry.idle_generation == generation
            );
            if still_idle { inner.entries.remove(id) } else { None }
        };
        if let Some(entry) = victim {
            info!(model_id = id, "idle timeout, unloading model");
            entry.instance.dispose();
        }
    }

    /// Evict ref-count-zero entries, LRU first, until the incoming size
    /// fits under the budget. Ties on last-used break by backend priority
    /// (lower first) then insertion order.
    fn evict_for_budget(&self, incoming_mb: u64) {
        let mut victims: Vec<(String, Arc<dyn ModelInstance>)> = Vec::new();
        {
            let mut inner = self.inner.lock();
            loop {
                let usage: u64 = inner.entries.values().map(|e| e.size_estimate_mb).sum();
                if usage + incoming_mb <= self.config.max_memory_mb {
                    break;
                }
                let Some(victim_id) = inner
                    .entries
                    .iter()
                    .filter(|(_, e)| e.ref_count == 0)
                    .min_by_key(|(_, e)| {
                        (
                            e.last_used_at_ms,
                            e.backend.eviction_priority(),
                            e.insertion_seq,
                        )
                    })
                    .map(|(id, _)| id.clone())
                else {
                    warn!(
                        usage,
                        incoming_mb,
                        budget = self.config.max_memory_mb,
                        "memory budget exceeded but every entry is referenced"
                    );
                    break;
                };
                if let Some(entry) = inner.entries.remove(&victim_id) {
                    victims.push((victim_id, entry.instance));
                }
            }
        }
        for (id, instance) in victims {
            info!(model_id = %id, "evicted from registry for memory budget");
            instance.dispose();
        }
    }

    pub fn get(&self, id: &str) -> Option<ModelEntryInfo> {
        let inner = self.inner.lock();
        inner.entries.get(id).map(|entry| ModelEntryInfo {
            id: id.to_string(),
            backend: entry.backend,
            size_estimate_mb: entry.size_estimate_mb,
            ref_count: entry.ref_count,
            loaded_at_ms: entry.loaded_at_ms,
            last_used_at_ms: entry.last_used_at_ms,
        })
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    pub fn ref_count(&self, id: &str) -> u32 {
        self.inner
            .lock()
            .entries
            .get(id)
            .map(|e| e.ref_count)
            .unwrap_or(0)
    }

    pub fn current_usage_mb(&self) -> u64 {
        self.inner
            .lock()
            .entries
            .values()
            .map(|e| e.size_estimate_mb)
            .sum()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unload one model immediately, regardless of references.
    pub fn unload(&self, id: &str) {
        let victim = self.inner.lock().entries.remove(id);
        if let Some(entry) = victim {
            if entry.ref_count > 0 {
                warn!(model_id = id, ref_count = entry.ref_count, "unloading a referenced model");
            }
            entry.instance.dispose();
            info!(model_id = id, "model unloaded");
        }
    }

    /// Unload everything.
    pub fn unload_all(&self) {
        let entries: Vec<(String, Entry)> = {
            let mut inner = self.inner.lock();
            inner.entries.drain().collect()
        };
        for (id, entry) in entries {
            entry.instance.dispose();
            debug!(model_id = %id, "model unloaded");
        }
    }

    /// Test support: drop every entry and load guard.
    pub fn reset(&self) {
        self.unload_all();
        self.load_guards.lock().clear();
    }
}

static GLOBAL: Lazy<Arc<SharedModelRegistry>> = Lazy::new(SharedModelRegistry::with_defaults);

/// The process-wide registry.
pub fn global() -> Arc<SharedModelRegistry> {
    Arc::clone(&GLOBAL)
}
