//! Epoch/sequence stamping for generation events.
//!
//! Every `generate` call advances the orchestrator's epoch; every event
//! inside that request carries a monotone `(epoch, seq)` envelope. A
//! consumer filtering with [`EpochGate`] drops events from superseded
//! epochs — this is how late tokens from an aborted generation never
//! reach the application.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::provider::TokenUsage;

/// Monotone stamp carried by every generation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Envelope {
    pub epoch: u64,
    pub seq: u64,
}

/// Per-orchestrator epoch counter.
#[derive(Debug, Default)]
pub struct EpochClock {
    epoch: AtomicU64,
}

impl EpochClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Advance to the next epoch and return it. Called once per request.
    pub fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Stamps events within one epoch with a monotone sequence number.
#[derive(Debug)]
pub struct EnvelopeStamper {
    epoch: u64,
    seq: AtomicU64,
}

impl EnvelopeStamper {
    pub fn new(epoch: u64) -> Self {
        Self { epoch, seq: AtomicU64::new(0) }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stamp(&self) -> Envelope {
        Envelope {
            epoch: self.epoch,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        }
    }
}

/// Streaming generation events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GenerationEvent {
    Token {
        token: String,
        epoch: u64,
        seq: u64,
    },
    Final {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        epoch: u64,
        seq: u64,
    },
    /// Terminal marker for an aborted stream; partial text stays with
    /// whatever the consumer accumulated from prior token events.
    Aborted { epoch: u64, seq: u64 },
}

impl GenerationEvent {
    pub fn envelope(&self) -> Envelope {
        match self {
            GenerationEvent::Token { epoch, seq, .. }
            | GenerationEvent::Final { epoch, seq, .. }
            | GenerationEvent::Aborted { epoch, seq } => Envelope { epoch: *epoch, seq: *seq },
        }
    }

    pub fn token(token: impl Into<String>, env: Envelope) -> Self {
        GenerationEvent::Token { token: token.into(), epoch: env.epoch, seq: env.seq }
    }

    pub fn final_event(text: impl Into<String>, usage: Option<TokenUsage>, env: Envelope) -> Self {
        GenerationEvent::Final { text: text.into(), usage, epoch: env.epoch, seq: env.seq }
    }

    pub fn aborted(env: Envelope) -> Self {
        GenerationEvent::Aborted { epoch: env.epoch, seq: env.seq }
    }
}

/// Consumer-side filter enforcing epoch monotonicity.
///
/// `admit` returns false for any event whose epoch is lower than the
/// highest epoch observed so far, and raises the bar when a newer epoch
/// appears.
#[derive(Debug, Default)]
pub struct EpochGate {
    observed: AtomicU64,
}

impl EpochGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, envelope: Envelope) -> bool {
        let mut current = self.observed.load(Ordering::SeqCst);
        loop {
            if envelope.epoch < current {
                return false;
            }
            if envelope.epoch == current {
                return true;
            }
            match self.observed.compare_exchange(
                current,
                envelope.epoch,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn observed_epoch(&self) -> u64 {
        self.observed.load(Ordering::SeqCst)
    }
}
