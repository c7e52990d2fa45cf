//! Watchdogs for the two unbounded phases.
//!
//! The download watchdog polices `Downloading`: an indeterminate download
//! with no progress heartbeat for five minutes is flagged stuck, once.
//! Determinate downloads are never flagged — byte counts are trusted.
//!
//! The healthcheck watchdog polices `Generating`, the only state with no
//! wall-clock deadline: if the provider goes token-silent past the budget
//! (separate budgets for prefill and steady-state), the orchestrator
//! aborts the request and returns to `Ready` so a new generation can
//! start immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use edgerun_kernel::now_epoch_ms;
use edgerun_kernel::state::{DownloadVariant, RuntimeState, StateKind, StateMachine};

/// Download watchdog tuning.
#[derive(Debug, Clone, Copy)]
pub struct DownloadWatchdogConfig {
    pub poll_interval: Duration,
    /// Progress silence after which an indeterminate download is stuck.
    pub stuck_after: Duration,
}

impl Default for DownloadWatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            stuck_after: Duration::from_secs(300),
        }
    }
}

/// Running watchdog task; stops when dropped or explicitly.
pub struct WatchdogHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchdogHandle {
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        self.stop.cancel();
        self.task.abort();
    }
}

/// Spawn the download watchdog.
///
/// `on_stuck` runs at most once, from the watchdog task, when the current
/// state is still an indeterminate `Downloading` whose last progress (or
/// state entry) is older than the configured silence window.
pub fn spawn_download_watchdog(
    config: DownloadWatchdogConfig,
    state: Arc<StateMachine>,
    on_stuck: impl Fn() + Send + Sync + 'static,
) -> WatchdogHandle {
    let stop = CancellationToken::new();
    let stop_inner = stop.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so the watchdog
        // never fires before one full poll interval has passed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_inner.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let snapshot = state.snapshot();
            let RuntimeState::Downloading { variant, last_progress_at_ms, .. } = snapshot.state
            else {
                debug!("download watchdog retired, state left DOWNLOADING");
                break;
            };
            if variant == DownloadVariant::Determinate {
                continue;
            }

            let reference = last_progress_at_ms.max(snapshot.since_ms);
            let silence_ms = now_epoch_ms().saturating_sub(reference);
            if silence_ms > config.stuck_after.as_millis() as u64 {
                warn!(silence_ms, "indeterminate download is stuck");
                on_stuck();
                break;
            }
        }
    });

    WatchdogHandle { stop, task }
}

/// Healthcheck watchdog tuning.
#[derive(Debug, Clone, Copy)]
pub struct HealthcheckConfig {
    pub poll_interval: Duration,
    /// Silence budget before the first token of the epoch arrives.
    pub prefill_silence: Duration,
    /// Silence budget once tokens are flowing.
    pub steady_silence: Duration,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            prefill_silence: Duration::from_secs(60),
            steady_silence: Duration::from_secs(30),
        }
    }
}

/// Shared token-activity record for one generation.
///
/// The generation path calls [`GenerationPulse::record_token`] per token;
/// the watchdog reads the stamps. `restart` resets both after an engine
/// recreation so warm-up time is not billed as silence.
#[derive(Debug)]
pub struct GenerationPulse {
    started_at_ms: AtomicU64,
    last_token_at_ms: AtomicU64,
    tokens: AtomicU64,
}

impl GenerationPulse {
    pub fn new() -> Self {
        Self {
            started_at_ms: AtomicU64::new(now_epoch_ms()),
            last_token_at_ms: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
        }
    }

    pub fn record_token(&self) {
        self.last_token_at_ms.store(now_epoch_ms(), Ordering::SeqCst);
        self.tokens.fetch_add(1, Ordering::SeqCst);
    }

    /// Reset for a fresh attempt within the same request.
    pub fn restart(&self) {
        self.started_at_ms.store(now_epoch_ms(), Ordering::SeqCst);
        self.last_token_at_ms.store(0, Ordering::SeqCst);
        self.tokens.store(0, Ordering::SeqCst);
    }

    pub fn tokens_emitted(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    pub fn last_token_at_ms(&self) -> u64 {
        self.last_token_at_ms.load(Ordering::SeqCst)
    }

    fn silence_ms(&self) -> (u64, bool) {
        let last = self.last_token_at_ms.load(Ordering::SeqCst);
        let started = self.started_at_ms.load(Ordering::SeqCst);
        let in_prefill = last == 0;
        let reference = if in_prefill { started } else { last };
        (now_epoch_ms().saturating_sub(reference), in_prefill)
    }
}

impl Default for GenerationPulse {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the generation healthcheck.
///
/// `on_stall` runs at most once, when silence exceeds the applicable
/// budget while the machine is still in `Generating`.
pub fn spawn_healthcheck(
    config: HealthcheckConfig,
    pulse: Arc<GenerationPulse>,
    state: Arc<StateMachine>,
    on_stall: impl Fn() + Send + Sync + 'static,
) -> WatchdogHandle {
    let stop = CancellationToken::new();
    let stop_inner = stop.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_inner.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if state.kind() != StateKind::Generating {
                debug!("healthcheck retired, state left GENERATING");
                break;
            }

            let (silence_ms, in_prefill) = pulse.silence_ms();
            let budget = if in_prefill {
                config.prefill_silence
            } else {
                config.steady_silence
            };
            if silence_ms > budget.as_millis() as u64 {
                warn!(silence_ms, in_prefill, "generation is token-silent past budget");
                on_stall();
                break;
            }
        }
    });

    WatchdogHandle { stop, task }
}
