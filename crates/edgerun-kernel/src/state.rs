//! Runtime lifecycle state machine.
//!
//! Thirteen named states with a static transition allow-list. Two escapes
//! bypass the list: transitions *into* [`StateKind::Error`] and
//! [`StateKind::TearingDown`] are always permitted. Every other pair must
//! appear in [`allowed_targets`] or the transition fails with
//! `ERROR_INVALID_STATE`.
//!
//! Each non-terminal state carries a wall-clock deadline derived from a
//! per-state baseline scaled by the configured timeout multiplier.
//! `Generating` deliberately has none: it is policed by the token-silence
//! healthcheck watchdog instead.
//!
//! Subscribers are notified synchronously, in registration order, with
//! `(new, prev)` on every transition; a panicking listener is isolated and
//! never propagates. Progress counters inside a state (bytes downloaded,
//! tokens emitted) are updated through [`StateMachine::amend`], which
//! replaces the snapshot copy-on-write without notifying — the logical
//! state has not changed.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::now_epoch_ms;
use crate::provider::ProviderId;

/// Discriminant-only view of [`RuntimeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    Idle,
    Booting,
    SelectingProvider,
    PreflightQuota,
    CheckingCache,
    Downloading,
    WarmingUp,
    Ready,
    Generating,
    Error,
    Disabled,
    Rehydrating,
    TearingDown,
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StateKind::Idle => "IDLE",
            StateKind::Booting => "BOOTING",
            StateKind::SelectingProvider => "SELECTING_PROVIDER",
            StateKind::PreflightQuota => "PREFLIGHT_QUOTA",
            StateKind::CheckingCache => "CHECKING_CACHE",
            StateKind::Downloading => "DOWNLOADING",
            StateKind::WarmingUp => "WARMING_UP",
            StateKind::Ready => "READY",
            StateKind::Generating => "GENERATING",
            StateKind::Error => "ERROR",
            StateKind::Disabled => "DISABLED",
            StateKind::Rehydrating => "REHYDRATING",
            StateKind::TearingDown => "TEARING_DOWN",
        };
        f.write_str(s)
    }
}

/// How a download reports progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadVariant {
    /// Total bytes known; progress is monotone byte counts.
    Determinate,
    /// Only heartbeats; policed by the 5-minute silence watchdog.
    Indeterminate,
}

/// The tagged runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum RuntimeState {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "BOOTING", rename_all = "camelCase")]
    Booting { step: String },
    #[serde(rename = "SELECTING_PROVIDER", rename_all = "camelCase")]
    SelectingProvider {
        policy_order: Vec<ProviderId>,
        tried: Vec<ProviderId>,
    },
    #[serde(rename = "PREFLIGHT_QUOTA", rename_all = "camelCase")]
    PreflightQuota {
        model_id: String,
        required_bytes: u64,
        estimate_supported: bool,
    },
    #[serde(rename = "CHECKING_CACHE", rename_all = "camelCase")]
    CheckingCache {
        model_id: String,
        cache_hit: Option<bool>,
    },
    #[serde(rename = "DOWNLOADING", rename_all = "camelCase")]
    Downloading {
        variant: DownloadVariant,
        total_bytes: Option<u64>,
        downloaded_bytes: u64,
        last_progress_at_ms: u64,
    },
    #[serde(rename = "WARMING_UP", rename_all = "camelCase")]
    WarmingUp { phase: String },
    #[serde(rename = "READY", rename_all = "camelCase")]
    Ready { model_id: String },
    #[serde(rename = "GENERATING", rename_all = "camelCase")]
    Generating {
        epoch: u64,
        request_seq: u64,
        is_aborting: bool,
        tokens_emitted: u64,
        last_token_at_ms: u64,
    },
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error {
        error: RuntimeError,
        can_rehydrate: bool,
    },
    #[serde(rename = "DISABLED", rename_all = "camelCase")]
    Disabled { reason: String },
    #[serde(rename = "REHYDRATING", rename_all = "camelCase")]
    Rehydrating { reason: String, attempt: u32 },
    #[serde(rename = "TEARING_DOWN", rename_all = "camelCase")]
    TearingDown { reason: String },
}

impl RuntimeState {
    pub fn kind(&self) -> StateKind {
        match self {
            RuntimeState::Idle => StateKind::Idle,
            RuntimeState::Booting { .. } => StateKind::Booting,
            RuntimeState::SelectingProvider { .. } => StateKind::SelectingProvider,
            RuntimeState::PreflightQuota { .. } => StateKind::PreflightQuota,
            RuntimeState::CheckingCache { .. } => StateKind::CheckingCache,
            RuntimeState::Downloading { .. } => StateKind::Downloading,
            RuntimeState::WarmingUp { .. } => StateKind::WarmingUp,
            RuntimeState::Ready { .. } => StateKind::Ready,
            RuntimeState::Generating { .. } => StateKind::Generating,
            RuntimeState::Error { .. } => StateKind::Error,
            RuntimeState::Disabled { .. } => StateKind::Disabled,
            RuntimeState::Rehydrating { .. } => StateKind::Rehydrating,
            RuntimeState::TearingDown { .. } => StateKind::TearingDown,
        }
    }
}

/// Allowed transition targets per source state.
///
/// `Error` and `TearingDown` are additionally reachable from anywhere; see
/// [`transition_allowed`].
pub fn allowed_targets(from: StateKind) -> &'static [StateKind] {
    use StateKind::*;
    match from {
        Idle => &[Booting],
        Booting => &[SelectingProvider, Error],
        SelectingProvider => &[PreflightQuota, Disabled, Error],
        PreflightQuota => &[CheckingCache, Error],
        CheckingCache => &[WarmingUp, Downloading, Error],
        Downloading => &[WarmingUp, Error],
        WarmingUp => &[Ready, Error],
        Ready => &[Generating, TearingDown],
        Generating => &[Ready, Error],
        Error => &[Rehydrating, TearingDown, Idle],
        Disabled => &[TearingDown, Idle],
        Rehydrating => &[SelectingProvider, Error, TearingDown],
        TearingDown => &[Idle],
    }
}

/// True when `from -> to` is lawful, including the emergency escapes.
pub fn transition_allowed(from: StateKind, to: StateKind) -> bool {
    to == StateKind::Error
        || to == StateKind::TearingDown
        || allowed_targets(from).contains(&to)
}

/// Baseline deadline per state, before the timeout multiplier.
///
/// `None` for terminal/parked states and for `Generating`, which has no
/// wall-clock deadline by design.
pub fn base_deadline_ms(kind: StateKind) -> Option<u64> {
    match kind {
        StateKind::Booting => Some(10_000),
        StateKind::SelectingProvider => Some(5_000),
        StateKind::PreflightQuota => Some(3_000),
        StateKind::CheckingCache => Some(5_000),
        StateKind::Downloading => Some(900_000),
        StateKind::WarmingUp => Some(30_000),
        StateKind::Rehydrating => Some(15_000),
        StateKind::TearingDown => Some(10_000),
        StateKind::Idle
        | StateKind::Ready
        | StateKind::Generating
        | StateKind::Error
        | StateKind::Disabled => None,
    }
}

/// One observed state plus the common base fields every state carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(flatten)]
    pub state: RuntimeState,
    pub since_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<ProviderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_report_id: Option<String>,
}

impl StateSnapshot {
    pub fn kind(&self) -> StateKind {
        self.state.kind()
    }
}

/// Listener invoked with `(new, prev)` on every transition.
pub type StateListener = Box<dyn Fn(&StateSnapshot, &StateSnapshot) + Send + Sync>;

/// Opaque handle for unsubscribing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// The lifecycle state machine.
///
/// Transitions are serialized by an internal lock; listeners observe them
/// in order because notification happens synchronously before the
/// transition call returns.
pub struct StateMachine {
    current: RwLock<StateSnapshot>,
    listeners: RwLock<Vec<(u64, Arc<StateListener>)>>,
    /// Serializes transition+notify so listeners observe transitions in
    /// the order they committed. Listeners must not transition
    /// reentrantly.
    ordering: parking_lot::Mutex<()>,
    next_listener_id: AtomicU64,
    timeout_multiplier: f64,
}

impl StateMachine {
    pub fn new(timeout_multiplier: f64) -> Self {
        Self {
            current: RwLock::new(StateSnapshot {
                state: RuntimeState::Idle,
                since_ms: now_epoch_ms(),
                deadline_ms: None,
                deadline_at_ms: None,
                provider_id: None,
                selection_report_id: None,
            }),
            listeners: RwLock::new(Vec::new()),
            ordering: parking_lot::Mutex::new(()),
            next_listener_id: AtomicU64::new(1),
            timeout_multiplier,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.current.read().clone()
    }

    pub fn kind(&self) -> StateKind {
        self.current.read().kind()
    }

    /// Generation may start only from `Ready`.
    pub fn can_generate(&self) -> bool {
        self.kind() == StateKind::Ready
    }

    /// Abort is meaningful while generating or downloading.
    pub fn can_abort(&self) -> bool {
        matches!(self.kind(), StateKind::Generating | StateKind::Downloading)
    }

    /// Perform a guarded transition.
    ///
    /// On success returns the new snapshot after all listeners ran.
    pub fn transition(&self, next: RuntimeState) -> RuntimeResult<StateSnapshot> {
        let _ordering = self.ordering.lock();
        let (prev, new) = {
            let mut current = self.current.write();
            let from = current.kind();
            let to = next.kind();
            if !transition_allowed(from, to) {
                return Err(RuntimeError::invalid_transition(from, to));
            }

            let now = now_epoch_ms();
            let deadline_ms = base_deadline_ms(to)
                .map(|base| (base as f64 * self.timeout_multiplier).round() as u64);
            let new = StateSnapshot {
                state: next,
                since_ms: now,
                deadline_ms,
                deadline_at_ms: deadline_ms.map(|d| now + d),
                provider_id: current.provider_id,
                selection_report_id: current.selection_report_id.clone(),
            };
            let prev = std::mem::replace(&mut *current, new.clone());
            (prev, new)
        };

        debug!(from = %prev.kind(), to = %new.kind(), "state transition");
        self.notify(&new, &prev);
        Ok(new)
    }

    /// Update payload fields of the current state without a transition.
    ///
    /// Copy-on-write: the closure mutates a clone which then replaces the
    /// stored snapshot. Listeners are not notified — the logical state is
    /// unchanged, only progress counters moved. The state kind must not
    /// change; an attempt to do so is ignored with a warning.
    pub fn amend(&self, f: impl FnOnce(&mut RuntimeState)) {
        let mut current = self.current.write();
        let mut state = current.state.clone();
        let kind_before = state.kind();
        f(&mut state);
        if state.kind() != kind_before {
            warn!(
                from = %kind_before,
                to = %state.kind(),
                "amend attempted to change the state kind; ignored"
            );
            return;
        }
        current.state = state;
    }

    /// Stamp the provider on the common base fields.
    pub fn set_provider(&self, provider: Option<ProviderId>) {
        self.current.write().provider_id = provider;
    }

    /// Stamp the selection report id on the common base fields.
    pub fn set_selection_report_id(&self, id: Option<String>) {
        self.current.write().selection_report_id = id;
    }

    pub fn subscribe(&self, listener: StateListener) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, Arc::new(listener)));
        ListenerId(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners.write().retain(|(lid, _)| *lid != id.0);
    }

    fn notify(&self, new: &StateSnapshot, prev: &StateSnapshot) {
        let listeners: Vec<Arc<StateListener>> = {
            let guard = self.listeners.read();
            guard.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            // A listener must never take the machine down with it.
            let result = catch_unwind(AssertUnwindSafe(|| listener(new, prev)));
            if result.is_err() {
                warn!(state = %new.kind(), "state listener panicked; isolated");
            }
        }
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current.read().kind())
            .field("timeout_multiplier", &self.timeout_multiplier)
            .finish()
    }
}
