//! Environment probe.
//!
//! Captures the device fingerprint (platform, language, cores, memory)
//! and the capability record the selectors consume. GPU-class detection
//! uses filesystem and process probes rather than linking any GPU
//! library, so the crate stays lightweight on every host.

use std::path::Path;

use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

use edgerun_kernel::env::{Capabilities, DeviceFingerprint};

/// Capture the host fingerprint.
///
/// Runs synchronously; call from a blocking context or `spawn_blocking`.
pub fn capture_fingerprint() -> DeviceFingerprint {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_memory();

    let total_bytes = sys.total_memory();
    let device_memory_gb = if total_bytes > 0 {
        Some((total_bytes as f64 / 1_073_741_824.0 * 10.0).round() / 10.0)
    } else {
        None
    };

    let fingerprint = DeviceFingerprint {
        user_agent: format!(
            "edgerun/{} ({}; {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        ),
        platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        language: std::env::var("LANG")
            .ok()
            .and_then(|l| l.split('.').next().map(str::to_string))
            .unwrap_or_else(|| "en-US".to_string()),
        hardware_concurrency: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        device_memory_gb,
        // A native process owns its execution context; both flags hold by
        // construction, unlike in delegated embeddings.
        is_secure_context: true,
        cross_origin_isolated: true,
    };
    debug!(?fingerprint, "device fingerprint captured");
    fingerprint
}

/// Capture the capability record.
///
/// `storage_root` is the model-store directory; cache and index
/// capabilities reflect whether it is writable.
pub fn capture_capabilities(storage_root: &Path) -> Capabilities {
    let gpu = detect_gpu();
    let storage_writable = storage_writable(storage_root);

    let caps = Capabilities {
        // No OS-provided model broker is probed for on this host class.
        has_window_ai: false,
        has_web_gpu: gpu,
        has_web_nn: false,
        has_storage_estimate: true,
        has_cache_storage: storage_writable,
        has_indexed_db: storage_writable,
    };
    debug!(?caps, "capabilities captured");
    caps
}

/// True when any GPU compute device is visible.
///
/// Detection strategy, cheapest first:
/// 1. `/dev/nvidia0` (NVIDIA kernel module loaded)
/// 2. `/dev/kfd` (AMD Kernel Fusion Driver)
/// 3. `/dev/dri/renderD128` (any DRM render node)
fn detect_gpu() -> bool {
    if Path::new("/dev/nvidia0").exists()
        || Path::new("/dev/kfd").exists()
        || Path::new("/dev/dri/renderD128").exists()
    {
        return true;
    }
    false
}

fn storage_writable(root: &Path) -> bool {
    if std::fs::create_dir_all(root).is_err() {
        return false;
    }
    let probe = root.join(".edgerun-write-probe");
    let ok = std::fs::write(&probe, b"ok").is_ok();
    let _ = std::fs::remove_file(&probe);
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn fingerprint_has_nonzero_concurrency() {
        let fp = capture_fingerprint();
        assert!(fp.hardware_concurrency >= 1);
        assert!(fp.user_agent.starts_with("edgerun/"));
        assert!(fp.platform.contains(std::env::consts::OS));
    }

    #[test]
    fn capabilities_reflect_writable_storage() {
        let dir = TempDir::new().unwrap();
        let caps = capture_capabilities(dir.path());
        assert!(caps.has_cache_storage);
        assert!(caps.has_indexed_db);
        assert!(caps.has_storage_estimate);
    }

    #[test]
    fn unwritable_root_disables_storage_capabilities() {
        let caps = capture_capabilities(Path::new("/proc/edgerun-definitely-unwritable"));
        assert!(!caps.has_cache_storage);
    }
}
