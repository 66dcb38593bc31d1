//! Dialogue engine interface and the emitter handle it writes through.
//!
//! The engine is an external collaborator: it receives the parsed inbound
//! turn request and a [`TurnEmitter`], and produces zero or more actions.
//! The emitter owns ordering-index assignment and live stream publication;
//! it never exposes the underlying session for mutation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use parlo_turn::{Action, CollectOutcome, StreamFrame, StreamHub, TurnSession};

/// A channel-parsed inbound event, normalized before the coordinator runs.
///
/// Per-platform webhook payload parsing happens upstream; connectors only
/// consume this canonical form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundTurnRequest {
    pub application_id: String,
    pub conversation_id: String,
    /// The end user the produced actions are delivered back to.
    pub recipient_id: String,
    #[serde(default)]
    pub text: String,
    /// Echo token returned verbatim in synchronous envelopes.
    #[serde(default)]
    pub conversation_token: String,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub external_parameters: BTreeMap<String, String>,
}

/// Engine-side handle for one turn.
pub struct TurnEmitter {
    session: Arc<TurnSession>,
    stream: Option<Arc<StreamHub>>,
    completion: Arc<Notify>,
    next_ordering_index: AtomicU64,
}

impl TurnEmitter {
    pub(crate) fn new(
        session: Arc<TurnSession>,
        stream: Option<Arc<StreamHub>>,
        completion: Arc<Notify>,
    ) -> Self {
        Self {
            session,
            stream,
            completion,
            next_ordering_index: AtomicU64::new(0),
        }
    }

    pub fn conversation_id(&self) -> &str {
        self.session.conversation_id()
    }

    /// Buffers one action, stamping its ordering index. Accepted actions on
    /// streamed turns are also pushed live to subscribers; an action flagged
    /// `last_of_turn` signals natural completion to the connector runtime.
    pub fn emit(&self, mut action: Action) -> CollectOutcome {
        action.ordering_index = self.next_ordering_index.fetch_add(1, Ordering::Relaxed);
        let last_of_turn = action.last_of_turn;
        let outcome = self.session.collect(action.clone());
        if outcome == CollectOutcome::Accepted {
            if let Some(stream) = &self.stream {
                stream.publish(&action.recipient_id.clone(), &StreamFrame::Action(action));
            }
        }
        if last_of_turn {
            self.completion.notify_one();
        }
        outcome
    }
}

#[async_trait]
/// Seam to the dialogue/story engine; implementations live outside this crate.
pub trait DialogueEngine: Send + Sync {
    async fn handle_turn(
        &self,
        request: InboundTurnRequest,
        emitter: Arc<TurnEmitter>,
    ) -> Result<()>;
}
