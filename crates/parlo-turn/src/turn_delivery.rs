//! Transport-agnostic delivery primitives.
//!
//! The synchronous responder completes a still-open HTTP response exactly
//! once; the stream hub fans frames out to live subscribers per recipient.
//! Out-of-band pushing lives with the channel connectors, since it needs a
//! platform HTTP client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::turn_compose::ComposedResponse;
use crate::turn_contract::Action;

/// One server-push unit: either a live action or the turn's merged tail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamFrame {
    Action(Action),
    Completed(ComposedResponse),
}

/// Completes a pending synchronous HTTP response exactly once.
///
/// The handler that owns the open connection awaits the receiver half; any
/// turn-termination path may call [`complete`](Self::complete), and only the
/// first call writes.
#[derive(Debug)]
pub struct SyncResponder {
    conversation_id: String,
    slot: Mutex<Option<oneshot::Sender<ComposedResponse>>>,
}

impl SyncResponder {
    pub fn new(conversation_id: impl Into<String>) -> (Self, oneshot::Receiver<ComposedResponse>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                conversation_id: conversation_id.into(),
                slot: Mutex::new(Some(sender)),
            },
            receiver,
        )
    }

    /// Returns true when this call performed the single completion.
    pub fn complete(&self, response: ComposedResponse) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => {
                error!(
                    conversation_id = %self.conversation_id,
                    "sync responder lock is poisoned; response dropped"
                );
                return false;
            }
        };
        let Some(sender) = sender else {
            error!(
                conversation_id = %self.conversation_id,
                "second completion attempt on sync responder ignored"
            );
            return false;
        };
        if sender.send(response).is_err() {
            warn!(
                conversation_id = %self.conversation_id,
                "sync response receiver dropped before completion"
            );
            return false;
        }
        true
    }
}

struct StreamSubscriber {
    subscriber_id: u64,
    sender: mpsc::UnboundedSender<StreamFrame>,
}

/// A live subscription handle; dropping the receiver makes the hub prune
/// the entry on the next publish without touching any turn state.
pub struct StreamSubscription {
    pub subscriber_id: u64,
    pub receiver: mpsc::UnboundedReceiver<StreamFrame>,
}

/// Per-recipient fan-out of stream frames to zero or more subscribers.
#[derive(Default)]
pub struct StreamHub {
    subscribers: Mutex<HashMap<String, Vec<StreamSubscriber>>>,
    next_subscriber_id: AtomicU64,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, recipient_id: &str) -> StreamSubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        match self.subscribers.lock() {
            Ok(mut subscribers) => {
                subscribers
                    .entry(recipient_id.to_string())
                    .or_default()
                    .push(StreamSubscriber {
                        subscriber_id,
                        sender,
                    });
                debug!(recipient_id, subscriber_id, "stream subscriber registered");
            }
            Err(_) => {
                warn!(recipient_id, "stream hub lock is poisoned; subscription inert");
            }
        }
        StreamSubscription {
            subscriber_id,
            receiver,
        }
    }

    pub fn unsubscribe(&self, recipient_id: &str, subscriber_id: u64) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            warn!(recipient_id, "stream hub lock is poisoned");
            return;
        };
        if let Some(entries) = subscribers.get_mut(recipient_id) {
            entries.retain(|entry| entry.subscriber_id != subscriber_id);
            if entries.is_empty() {
                subscribers.remove(recipient_id);
            }
        }
    }

    /// Sends one frame to every live subscriber for the recipient, in
    /// registration order, pruning closed subscriptions. Returns how many
    /// subscribers received the frame.
    pub fn publish(&self, recipient_id: &str, frame: &StreamFrame) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            warn!(recipient_id, "stream hub lock is poisoned; frame dropped");
            return 0;
        };
        let Some(entries) = subscribers.get_mut(recipient_id) else {
            return 0;
        };
        let mut delivered = 0;
        entries.retain(|entry| match entry.sender.send(frame.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                debug!(
                    recipient_id,
                    subscriber_id = entry.subscriber_id,
                    "stream subscriber closed; unregistered"
                );
                false
            }
        });
        if entries.is_empty() {
            subscribers.remove(recipient_id);
        }
        delivered
    }

    pub fn subscriber_count(&self, recipient_id: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| {
                subscribers
                    .get(recipient_id)
                    .map(|entries| entries.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }
}
