//! Per-conversation turn sessions and their registry.
//!
//! A session owns exactly one buffer/gate pair for one conversation. The
//! registry guarantees at most one live session per conversation id: inbound
//! events reuse the live session, and a replacement is only minted once the
//! previous turn reached `Ended`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use parlo_core::next_turn_id;

use crate::turn_buffer::TurnBuffer;
use crate::turn_contract::{Action, DeliveryDescriptor};
use crate::turn_gate::{CompletionGate, TurnState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of offering an action to a session.
pub enum CollectOutcome {
    Accepted,
    DiscardedEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why a turn reached its end transition.
pub enum EndReason {
    Completed,
    ForcedTimeout,
    ForcedError,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ForcedTimeout => "forced_timeout",
            Self::ForcedError => "forced_error",
        }
    }
}

#[derive(Debug)]
/// One conversational turn: buffer, gate, and routing context.
pub struct TurnSession {
    conversation_id: String,
    turn_id: String,
    delivery: DeliveryDescriptor,
    external_parameters: BTreeMap<String, String>,
    gate: CompletionGate,
    buffer: TurnBuffer,
}

impl TurnSession {
    pub fn new(
        conversation_id: impl Into<String>,
        delivery: DeliveryDescriptor,
        external_parameters: BTreeMap<String, String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turn_id: next_turn_id(),
            delivery,
            external_parameters,
            gate: CompletionGate::new(),
            buffer: TurnBuffer::new(),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub fn delivery(&self) -> &DeliveryDescriptor {
        &self.delivery
    }

    pub fn external_parameter(&self, key: &str) -> Option<&str> {
        self.external_parameters
            .get(key)
            .map(String::as_str)
            .or_else(|| self.delivery.endpoint_context.get(key).map(String::as_str))
    }

    pub fn state(&self) -> TurnState {
        self.gate.state()
    }

    /// First caller wins and performs the acknowledgement side effect.
    pub fn start(&self) -> bool {
        let won = self.gate.try_start();
        if !won {
            warn!(
                conversation_id = %self.conversation_id,
                turn_id = %self.turn_id,
                "duplicate turn start ignored"
            );
        }
        won
    }

    /// Buffers an action unless the turn already ended.
    pub fn collect(&self, action: Action) -> CollectOutcome {
        if self.gate.is_ended() {
            debug!(
                conversation_id = %self.conversation_id,
                turn_id = %self.turn_id,
                action_kind = action.kind().as_str(),
                "action collected after turn end; dropped"
            );
            return CollectOutcome::DiscardedEnded;
        }
        match self.buffer.append(action) {
            Ok(_) => CollectOutcome::Accepted,
            Err(error) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    turn_id = %self.turn_id,
                    %error,
                    "failed to buffer action; dropped"
                );
                CollectOutcome::DiscardedEnded
            }
        }
    }

    /// Ends the turn; the single winner receives the drained buffer.
    ///
    /// Losers get `None` and must not deliver anything — this is what makes
    /// delivery at-most-once regardless of how completion signals race.
    pub fn end(&self) -> Option<Vec<Action>> {
        if !self.gate.try_end() {
            warn!(
                conversation_id = %self.conversation_id,
                turn_id = %self.turn_id,
                "duplicate turn end ignored"
            );
            return None;
        }
        match self.buffer.drain() {
            Ok(actions) => Some(actions),
            Err(error) => {
                warn!(
                    conversation_id = %self.conversation_id,
                    turn_id = %self.turn_id,
                    %error,
                    "turn ended but buffer drain failed; flushing empty turn"
                );
                Some(Vec::new())
            }
        }
    }

    /// Identical winner semantics to [`end`](Self::end); the synthesized
    /// error action, when supplied, is appended after the drained buffer.
    pub fn force_end(&self, error_action: Option<Action>) -> Option<Vec<Action>> {
        let mut actions = self.end()?;
        if let Some(error_action) = error_action {
            actions.push(error_action);
        }
        Some(actions)
    }
}

#[derive(Debug, Default)]
/// Tracks the single live session per conversation id.
pub struct TurnSessionRegistry {
    sessions: Mutex<HashMap<String, Arc<TurnSession>>>,
}

impl TurnSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live session for the conversation, or installs a new one
    /// when none exists or the previous turn already ended.
    pub fn obtain(
        &self,
        conversation_id: &str,
        delivery: DeliveryDescriptor,
        external_parameters: BTreeMap<String, String>,
    ) -> Result<Arc<TurnSession>> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow!("turn session registry lock is poisoned"))?;
        if let Some(existing) = sessions.get(conversation_id) {
            if existing.state() != TurnState::Ended {
                debug!(
                    conversation_id,
                    turn_id = existing.turn_id(),
                    "reusing live turn session"
                );
                return Ok(Arc::clone(existing));
            }
        }
        let session = Arc::new(TurnSession::new(
            conversation_id,
            delivery,
            external_parameters,
        ));
        sessions.insert(conversation_id.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Drops the registry entry once its turn has been flushed. A stale
    /// `turn_id` (another turn already replaced it) leaves the entry alone.
    pub fn release(&self, conversation_id: &str, turn_id: &str) {
        let Ok(mut sessions) = self.sessions.lock() else {
            warn!(conversation_id, "turn session registry lock is poisoned");
            return;
        };
        if sessions
            .get(conversation_id)
            .is_some_and(|session| session.turn_id() == turn_id)
        {
            sessions.remove(conversation_id);
        }
    }

    pub fn live_count(&self) -> usize {
        self.sessions.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }
}
