//! Idempotent start/end coordination for one conversational turn.
//!
//! Two independent "already happened" latches updated by compare-and-set, so
//! `try_start` and `try_end` never block each other. Whichever caller wins
//! the end latch owns the single buffer drain and flush; losers are told so
//! and must treat the call as a no-op.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `TurnState` values.
pub enum TurnState {
    NotStarted,
    Started,
    Ended,
}

impl TurnState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Started => "started",
            Self::Ended => "ended",
        }
    }
}

#[derive(Debug, Default)]
/// Tri-state lifecycle coordinator with monotonic, one-directional latches.
pub struct CompletionGate {
    started: AtomicBool,
    ended: AtomicBool,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for exactly one caller; that caller performs the
    /// immediate-acknowledgement side effect.
    pub fn try_start(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true for exactly one caller; that caller drains the buffer
    /// and flushes. Races between a natural completion signal and a timeout
    /// watchdog resolve here.
    pub fn try_end(&self) -> bool {
        self.ended
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// `Ended` wins over `Started`: a turn force-ended before its start
    /// side effect ran still reports the terminal state.
    pub fn state(&self) -> TurnState {
        if self.is_ended() {
            TurnState::Ended
        } else if self.is_started() {
            TurnState::Started
        } else {
            TurnState::NotStarted
        }
    }
}
