//! Advisory single-download lock.
//!
//! At most one model download runs per process: parallel large downloads
//! starve each other and trip host throttling. The lock is advisory and
//! injectable; the lazy shared default covers hosts that construct more
//! than one orchestrator.

use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Cloneable handle to one advisory lock.
#[derive(Clone)]
pub struct DownloadLock {
    inner: Arc<Mutex<()>>,
}

impl DownloadLock {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(())) }
    }

    /// Wait for exclusive download rights.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        let waited = std::time::Instant::now();
        let guard = Arc::clone(&self.inner).lock_owned().await;
        let waited_ms = waited.elapsed().as_millis();
        if waited_ms > 0 {
            debug!(waited_ms, "download lock acquired after wait");
        }
        guard
    }
}

impl Default for DownloadLock {
    fn default() -> Self {
        Self::new()
    }
}

static SHARED: Lazy<DownloadLock> = Lazy::new(DownloadLock::new);

/// The process-wide default lock.
pub fn shared() -> DownloadLock {
    SHARED.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn lock_serializes_downloads() {
        let lock = DownloadLock::new();
        let concurrent = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shared_lock_is_one_instance() {
        let a = shared();
        let guard = a.acquire().await;
        let b = shared();
        assert!(b.inner.try_lock().is_err(), "same underlying mutex");
        drop(guard);
    }
}
