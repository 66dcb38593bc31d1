//! Response composition: merging a drained turn into channel-valid payloads.
//!
//! A single left-to-right pairwise reduction over the buffered actions.
//! Adjacent merge-compatible fragments combine; non-adjacent fragments are
//! never reordered. The function is pure: channel-shape problems surface as
//! returned warnings, and the caller decides how to log them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use parlo_core::is_blank;

use crate::turn_contract::{
    Action, ActionPayload, CardFragment, ControlDirective, Suggestion, TextFragment,
    TransferDirective,
};

pub const DEFAULT_MAX_FRAGMENTS: usize = 10;

#[derive(Debug, Clone)]
/// Channel shape constraints applied after the merge walk.
pub struct ComposePolicy {
    pub max_fragments: usize,
    /// Some channels require the first rendered item to be a plain text
    /// fragment; an empty one is synthesized when absent.
    pub require_leading_text: bool,
    pub dedupe_suggestions: bool,
}

impl Default for ComposePolicy {
    fn default() -> Self {
        Self {
            max_fragments: DEFAULT_MAX_FRAGMENTS,
            require_leading_text: false,
            dedupe_suggestions: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
/// One render-ready unit of a composed response.
pub enum ComposedFragment {
    Text(TextFragment),
    Card(CardFragment),
    Transfer(TransferDirective),
    Control(ControlDirective),
}

/// The channel-facing merged payload for one turn. Derived, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComposedResponse {
    pub fragments: Vec<ComposedFragment>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
    pub continues_conversation: bool,
}

impl ComposedResponse {
    /// An empty continuation response: nothing to render, conversation open.
    pub fn continuation() -> Self {
        Self {
            fragments: Vec::new(),
            suggestions: Vec::new(),
            continues_conversation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Non-fatal composition findings, reported out-of-band by the caller.
pub enum ComposeWarning {
    #[error("turn produced no renderable fragments")]
    EmptyTurn,
    #[error("{count} fragments exceed channel limit {limit}; truncated")]
    FragmentOverflow { count: usize, limit: usize },
    #[error("{dropped} actions after terminal directive discarded")]
    TrailingAfterTerminal { dropped: usize },
    #[error("duplicate suggestion key `{key}` dropped")]
    DuplicateSuggestion { key: String },
}

#[derive(Debug, Clone, PartialEq)]
/// Composition output plus everything the caller should log.
pub struct Composition {
    pub response: ComposedResponse,
    pub warnings: Vec<ComposeWarning>,
}

/// Fragments still eligible for pairwise merging during the walk.
#[derive(Debug, Clone)]
enum Mergeable {
    Text(TextFragment),
    Card(CardFragment),
}

impl From<Mergeable> for ComposedFragment {
    fn from(value: Mergeable) -> Self {
        match value {
            Mergeable::Text(fragment) => Self::Text(fragment),
            Mergeable::Card(fragment) => Self::Card(fragment),
        }
    }
}

/// Text fragments are merge-compatible when both or neither carry an
/// explicit spoken form; cards always merge with cards.
fn merge_compatible(a: &Mergeable, b: &Mergeable) -> bool {
    match (a, b) {
        (Mergeable::Text(a), Mergeable::Text(b)) => a.has_spoken() == b.has_spoken(),
        (Mergeable::Card(_), Mergeable::Card(_)) => true,
        _ => false,
    }
}

fn pause_marker(delay_ms: u64) -> String {
    format!("<break time=\"{delay_ms}ms\"/>")
}

fn join_with_pause(a: &str, b: &str, delay_ms: u64) -> String {
    if delay_ms > 0 {
        format!("{a} {} {b}", pause_marker(delay_ms))
    } else {
        format!("{a} {b}")
    }
}

/// Concatenates two text fragments. The pause marker lands in the spoken
/// rendering only; when neither fragment has an explicit spoken form the
/// display text itself is the spoken form and carries the marker.
fn merge_text(a: TextFragment, b: TextFragment, delay_ms: u64) -> TextFragment {
    if a.has_spoken() {
        TextFragment {
            text: format!("{} {}", a.text, b.text),
            spoken: join_with_pause(&a.spoken, &b.spoken, delay_ms),
        }
    } else {
        TextFragment {
            text: join_with_pause(&a.text, &b.text, delay_ms),
            spoken: String::new(),
        }
    }
}

fn first_non_blank(a: String, b: String) -> String {
    if is_blank(&a) {
        b
    } else {
        a
    }
}

/// Field-by-field card merge: first non-blank wins, non-empty buttons win.
fn merge_card(a: CardFragment, b: CardFragment) -> CardFragment {
    CardFragment {
        title: first_non_blank(a.title, b.title),
        subtitle: first_non_blank(a.subtitle, b.subtitle),
        body: first_non_blank(a.body, b.body),
        image_url: first_non_blank(a.image_url, b.image_url),
        buttons: if a.buttons.is_empty() { b.buttons } else { a.buttons },
    }
}

fn merge(a: Mergeable, b: Mergeable, delay_ms: u64) -> Mergeable {
    match (a, b) {
        (Mergeable::Text(a), Mergeable::Text(b)) => Mergeable::Text(merge_text(a, b, delay_ms)),
        (Mergeable::Card(a), Mergeable::Card(b)) => Mergeable::Card(merge_card(a, b)),
        // unreachable by construction: callers check merge_compatible first
        (a, _) => a,
    }
}

/// Merges the drained, ordered action list into one channel-valid response.
pub fn compose(actions: &[Action], policy: &ComposePolicy) -> Composition {
    let mut warnings = Vec::new();

    // Partition at the first terminal directive.
    let terminal_index = actions.iter().position(|action| action.payload.is_terminal());
    let (mergeable_actions, terminal) = match terminal_index {
        Some(index) => {
            let dropped = actions.len() - index - 1;
            if dropped > 0 {
                warnings.push(ComposeWarning::TrailingAfterTerminal { dropped });
            }
            (&actions[..index], Some(&actions[index].payload))
        }
        None => (actions, None),
    };

    // Gather suggestions in emission order before the merge walk collapses
    // fragment boundaries.
    let mut suggestions: Vec<Suggestion> = Vec::new();
    for action in mergeable_actions {
        for suggestion in &action.suggestions {
            let duplicate = suggestions.iter().any(|seen| seen.key == suggestion.key);
            if duplicate && policy.dedupe_suggestions {
                warnings.push(ComposeWarning::DuplicateSuggestion {
                    key: suggestion.key.clone(),
                });
            } else {
                suggestions.push(suggestion.clone());
            }
        }
    }

    // Left-to-right pairwise reduction over the renderable fragments.
    let mut fragments: Vec<ComposedFragment> = Vec::new();
    let mut current: Option<Mergeable> = None;
    for action in mergeable_actions {
        let next = match &action.payload {
            ActionPayload::Text(fragment) => {
                if is_blank(&fragment.text) && !fragment.has_spoken() {
                    continue;
                }
                Mergeable::Text(fragment.clone())
            }
            ActionPayload::Card(fragment) => Mergeable::Card(fragment.clone()),
            ActionPayload::Transfer(_) | ActionPayload::Control(_) => continue,
        };
        current = Some(match current.take() {
            None => next,
            Some(accumulator) => {
                if merge_compatible(&accumulator, &next) {
                    merge(accumulator, next, action.delay_ms)
                } else {
                    fragments.push(accumulator.into());
                    next
                }
            }
        });
    }
    if let Some(accumulator) = current.take() {
        fragments.push(accumulator.into());
    }

    // Channel shape constraints.
    if policy.require_leading_text
        && !fragments.is_empty()
        && !matches!(fragments.first(), Some(ComposedFragment::Text(_)))
    {
        fragments.insert(0, ComposedFragment::Text(TextFragment::default()));
    }
    if fragments.len() > policy.max_fragments {
        warnings.push(ComposeWarning::FragmentOverflow {
            count: fragments.len(),
            limit: policy.max_fragments,
        });
        fragments.truncate(policy.max_fragments);
    }

    let continues_conversation = terminal.is_none();
    match terminal {
        Some(ActionPayload::Transfer(transfer)) => {
            fragments.push(ComposedFragment::Transfer(transfer.clone()));
        }
        Some(ActionPayload::Control(control)) => {
            fragments.push(ComposedFragment::Control(control.clone()));
        }
        _ => {}
    }

    if fragments.is_empty() {
        warnings.push(ComposeWarning::EmptyTurn);
        return Composition {
            response: ComposedResponse::continuation(),
            warnings,
        };
    }

    Composition {
        response: ComposedResponse {
            fragments,
            suggestions,
            continues_conversation,
        },
        warnings,
    }
}
