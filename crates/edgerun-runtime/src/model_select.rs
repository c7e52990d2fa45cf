//! Model selection.
//!
//! Picks a model for the selected provider from a built-in catalog,
//! keyed by device memory and GPU availability, then validates the pick
//! against per-provider whitelists. Fallback chains list every smaller
//! compatible candidate so the quota pre-resolver can degrade instead of
//! failing outright.

use tracing::debug;

use edgerun_kernel::config::RuntimeConfig;
use edgerun_kernel::env::{Capabilities, DeviceFingerprint};
use edgerun_kernel::error::{ErrorCode, RuntimeError, RuntimeResult};
use edgerun_kernel::model::{ChatTemplate, EngineFamily, ModelSpec, ModelTier};
use edgerun_kernel::provider::ProviderId;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Repositories model sources may come from.
const ALLOWED_REPOS: &[&str] = &["mlc-ai", "HuggingFaceTB", "Qwen", "onnx-community"];

fn webllm_standard() -> ModelSpec {
    ModelSpec::new(
        "Llama-3.1-8B-Instruct-q4f16_1-MLC",
        EngineFamily::Webllm,
        "models/Llama-3.1-8B-Instruct-q4f16_1-MLC",
        (4.5 * GIB as f64) as u64,
    )
    .with_label("Llama 3.1 8B Instruct (q4f16)")
    .with_tier(ModelTier::Tier1)
    .with_context_window(8192)
    .with_hf_repo("mlc-ai/Llama-3.1-8B-Instruct-q4f16_1-MLC")
    .with_chat_template(ChatTemplate::simple())
}

fn webllm_nano() -> ModelSpec {
    ModelSpec::new(
        "Qwen2.5-0.5B-Instruct-q4f16_1-MLC",
        EngineFamily::Webllm,
        "models/Qwen2.5-0.5B-Instruct-q4f16_1-MLC",
        705 * MIB,
    )
    .with_label("Qwen 2.5 0.5B Instruct (q4f16)")
    .with_tier(ModelTier::Tier2)
    .with_context_window(4096)
    .with_hf_repo("mlc-ai/Qwen2.5-0.5B-Instruct-q4f16_1-MLC")
    .with_chat_template(ChatTemplate::simple())
}

fn webllm_micro() -> ModelSpec {
    ModelSpec::new(
        "SmolLM2-360M-Instruct-q4f16_1-MLC",
        EngineFamily::Webllm,
        "models/SmolLM2-360M-Instruct-q4f16_1-MLC",
        600 * MIB,
    )
    .with_label("SmolLM2 360M Instruct (q4f16)")
    .with_tier(ModelTier::Tier3)
    .with_context_window(2048)
    .with_hf_repo("mlc-ai/SmolLM2-360M-Instruct-q4f16_1-MLC")
    .with_chat_template(ChatTemplate::simple())
}

fn cpu_tier_a() -> ModelSpec {
    ModelSpec::new(
        "SmolLM2-360M-Instruct-Q8_0",
        EngineFamily::Wasm,
        "models/SmolLM2-360M-Instruct-Q8_0.gguf",
        350 * MIB,
    )
    .with_label("SmolLM2 360M Instruct (Q8)")
    .with_tier(ModelTier::Tier1)
    .with_context_window(2048)
    .with_hf_repo("HuggingFaceTB/SmolLM2-360M-Instruct")
    .with_chat_template(ChatTemplate::simple())
}

fn cpu_tier_b() -> ModelSpec {
    ModelSpec::new(
        "SmolLM2-360M-Instruct-Q4_K_M",
        EngineFamily::Wasm,
        "models/SmolLM2-360M-Instruct-Q4_K_M.gguf",
        250 * MIB,
    )
    .with_label("SmolLM2 360M Instruct (Q4)")
    .with_tier(ModelTier::Tier2)
    .with_context_window(2048)
    .with_hf_repo("HuggingFaceTB/SmolLM2-360M-Instruct")
    .with_chat_template(ChatTemplate::simple())
}

fn cpu_tier_c() -> ModelSpec {
    ModelSpec::new(
        "SmolLM2-135M-Instruct-Q4_K_M",
        EngineFamily::Wasm,
        "models/SmolLM2-135M-Instruct-Q4_K_M.gguf",
        100 * MIB,
    )
    .with_label("SmolLM2 135M Instruct (Q4)")
    .with_tier(ModelTier::Tier3)
    .with_context_window(2048)
    .with_hf_repo("HuggingFaceTB/SmolLM2-135M-Instruct")
    .with_chat_template(ChatTemplate::simple())
}

/// Candidate chain for a provider, largest first.
fn catalog(provider: ProviderId) -> Vec<ModelSpec> {
    match provider {
        ProviderId::Webllm => vec![webllm_standard(), webllm_nano(), webllm_micro()],
        ProviderId::Smollm | ProviderId::Wasm | ProviderId::Webnn => {
            vec![cpu_tier_a(), cpu_tier_b(), cpu_tier_c()]
        }
        ProviderId::Native | ProviderId::Mock => vec![ModelSpec::sentinel(provider)],
    }
}

fn tier_index(tier: ModelTier) -> usize {
    match tier {
        ModelTier::Tier1 => 0,
        ModelTier::Tier2 => 1,
        ModelTier::Tier3 => 2,
    }
}

/// Pick the primary model for `provider` on this device.
pub fn select_model(
    provider: ProviderId,
    fingerprint: &DeviceFingerprint,
    capabilities: &Capabilities,
    config: &RuntimeConfig,
) -> RuntimeResult<ModelSpec> {
    let chain = catalog(provider);

    if provider.uses_sentinel_model() {
        return Ok(chain.into_iter().next().expect("sentinel chain is non-empty"));
    }

    let index = if let Some(tier) = config.tier_override {
        tier_index(tier)
    } else {
        let mem_gb = fingerprint.device_memory_gb.unwrap_or(0.0);
        match provider {
            ProviderId::Webllm => {
                if mem_gb >= 8.0 && capabilities.has_web_gpu {
                    0
                } else if mem_gb >= 4.0 {
                    1
                } else {
                    2
                }
            }
            // CPU engines scale on memory alone.
            _ => {
                if mem_gb >= 4.0 {
                    0
                } else if mem_gb >= 2.0 {
                    1
                } else {
                    2
                }
            }
        }
    };

    let spec = chain
        .into_iter()
        .nth(index.min(2))
        .expect("catalog chains have three entries");
    debug!(provider = %provider, model_id = %spec.id, "model selected");
    validate_model(provider, &spec)?;
    Ok(spec)
}

/// Smaller compatible fallbacks for `primary`, in descending size.
pub fn fallback_candidates(provider: ProviderId, primary: &ModelSpec) -> Vec<ModelSpec> {
    catalog(provider)
        .into_iter()
        .filter(|spec| spec.id != primary.id && spec.size_bytes < primary.size_bytes)
        .collect()
}

/// Enforce the per-provider whitelist.
pub fn validate_model(provider: ProviderId, spec: &ModelSpec) -> RuntimeResult<()> {
    spec.validate()?;

    if provider.uses_sentinel_model() {
        return Ok(());
    }

    // MLC-compiled artifacts only run on the GPU engine.
    if spec.id.ends_with("-MLC") && provider != ProviderId::Webllm {
        return Err(RuntimeError::new(
            ErrorCode::WebllmIncompatibleModel,
            format!("model {} is MLC-compiled and requires the webllm provider", spec.id),
        )
        .at_provider(provider));
    }

    let allowed = catalog(provider);
    if !allowed.iter().any(|candidate| candidate.id == spec.id) {
        return Err(RuntimeError::new(
            ErrorCode::WebllmIncompatibleModel,
            format!("model {} is not whitelisted for provider {provider}", spec.id),
        )
        .at_provider(provider));
    }

    if let Some(repo) = &spec.hf_repo {
        let org = repo.split('/').next().unwrap_or_default();
        if !ALLOWED_REPOS.contains(&org) {
            return Err(RuntimeError::new(
                ErrorCode::WebllmIncompatibleModel,
                format!("repository {org} is not on the allow-list"),
            )
            .at_provider(provider));
        }
    }

    Ok(())
}
