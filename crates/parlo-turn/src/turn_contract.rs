//! Action contract types shared by the turn coordinator and channel connectors.
//!
//! Defines the closed action payload union, fragment types, and the delivery
//! mode descriptor. Validation helpers enforce the minimal shape inbound
//! producers must satisfy before actions enter a turn buffer.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use parlo_core::is_blank;

pub const TURN_CONTRACT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ActionKind` values.
pub enum ActionKind {
    Text,
    Card,
    Transfer,
    Control,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Card => "card",
            Self::Transfer => "transfer",
            Self::Control => "control",
        }
    }
}

/// A plain or spoken text fragment.
///
/// `spoken` is the voice-channel rendering; a blank value means the display
/// text doubles as the spoken form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TextFragment {
    pub text: String,
    #[serde(default)]
    pub spoken: String,
}

impl TextFragment {
    pub fn has_spoken(&self) -> bool {
        !is_blank(&self.spoken)
    }
}

/// A quick-reply/suggestion entry attached to an action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Suggestion {
    pub key: String,
    pub label: String,
}

/// A structured card fragment. Blank fields are treated as absent when two
/// adjacent cards merge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CardFragment {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub buttons: Vec<Suggestion>,
}

/// Hands the conversation over to another destination and ends the turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferDirective {
    pub target: String,
    #[serde(default)]
    pub reason: String,
}

/// A channel control operation that ends the turn (close, reset, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlDirective {
    pub operation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
/// Closed union over everything the dialogue engine can emit.
pub enum ActionPayload {
    Text(TextFragment),
    Card(CardFragment),
    Transfer(TransferDirective),
    Control(ControlDirective),
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Text(_) => ActionKind::Text,
            Self::Card(_) => ActionKind::Card,
            Self::Transfer(_) => ActionKind::Transfer,
            Self::Control(_) => ActionKind::Control,
        }
    }

    /// Transfer/control directives end the turn early; everything buffered
    /// after the first terminal payload is discarded by composition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transfer(_) | Self::Control(_))
    }
}

/// One discrete output unit produced by the dialogue engine for a turn.
///
/// Immutable once created; owned by the turn buffer until flushed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub action_id: String,
    pub recipient_id: String,
    #[serde(flatten)]
    pub payload: ActionPayload,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
    #[serde(default)]
    pub ordering_index: u64,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub last_of_turn: bool,
}

impl Action {
    pub fn new(recipient_id: impl Into<String>, payload: ActionPayload) -> Self {
        Self {
            action_id: parlo_core::next_event_id("action"),
            recipient_id: recipient_id.into(),
            payload,
            suggestions: Vec::new(),
            ordering_index: 0,
            delay_ms: 0,
            last_of_turn: false,
        }
    }

    pub fn text(recipient_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            recipient_id,
            ActionPayload::Text(TextFragment {
                text: text.into(),
                spoken: String::new(),
            }),
        )
    }

    pub fn card(recipient_id: impl Into<String>, card: CardFragment) -> Self {
        Self::new(recipient_id, ActionPayload::Card(card))
    }

    pub fn transfer(recipient_id: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            recipient_id,
            ActionPayload::Transfer(TransferDirective {
                target: target.into(),
                reason: String::new(),
            }),
        )
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<Suggestion>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn as_last_of_turn(mut self) -> Self {
        self.last_of_turn = true;
        self
    }

    pub fn kind(&self) -> ActionKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `DeliveryMode` values.
pub enum DeliveryMode {
    Sync,
    Stream,
    OutOfBand,
}

impl DeliveryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Stream => "stream",
            Self::OutOfBand => "out_of_band",
        }
    }
}

/// Delivery selection for one turn, fixed when the turn starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryDescriptor {
    pub mode: DeliveryMode,
    /// Routing parameters captured at turn start and threaded through to
    /// out-of-band pushes (conversation id, target bot id, echo tokens).
    pub endpoint_context: BTreeMap<String, String>,
}

impl DeliveryDescriptor {
    pub fn sync() -> Self {
        Self {
            mode: DeliveryMode::Sync,
            endpoint_context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.endpoint_context.insert(key.into(), value.into());
        self
    }
}

pub fn validate_action(action: &Action) -> Result<()> {
    if is_blank(&action.action_id) {
        bail!("action id cannot be blank");
    }
    if is_blank(&action.recipient_id) {
        bail!("action recipient id cannot be blank");
    }
    match &action.payload {
        ActionPayload::Transfer(transfer) if is_blank(&transfer.target) => {
            bail!("transfer directive requires a target");
        }
        ActionPayload::Control(control) if is_blank(&control.operation) => {
            bail!("control directive requires an operation");
        }
        _ => Ok(()),
    }
}
