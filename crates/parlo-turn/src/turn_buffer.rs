//! Ordered, thread-safe action collection for one conversational turn.
//!
//! The buffer only guarantees loss-free concurrent append and a single
//! atomic drain; lifecycle rules (no collect after `Ended`, drain exactly
//! once) are enforced by the owning [`crate::turn_session::TurnSession`]
//! through its completion gate.

use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::turn_contract::Action;

#[derive(Debug, Default)]
/// Insertion-ordered collector of actions, safe for concurrent producers.
pub struct TurnBuffer {
    entries: Mutex<Vec<Action>>,
}

impl TurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one action and returns the buffered count.
    pub fn append(&self, action: Action) -> Result<usize> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("turn buffer lock is poisoned"))?;
        entries.push(action);
        Ok(entries.len())
    }

    /// Removes and returns every buffered action in insertion order.
    ///
    /// Callers must hold the completion gate's winning end transition; the
    /// gate is what makes a second drain unreachable.
    pub fn drain(&self) -> Result<Vec<Action>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("turn buffer lock is poisoned"))?;
        Ok(std::mem::take(&mut *entries))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn append_preserves_insertion_order() {
        let buffer = TurnBuffer::new();
        for index in 0..8 {
            buffer
                .append(Action::text("user-1", format!("message {index}")))
                .expect("append");
        }
        let drained = buffer.drain().expect("drain");
        let texts: Vec<String> = drained
            .iter()
            .map(|action| match &action.payload {
                crate::turn_contract::ActionPayload::Text(fragment) => fragment.text.clone(),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        let expected: Vec<String> = (0..8).map(|index| format!("message {index}")).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn drain_empties_the_buffer() {
        let buffer = TurnBuffer::new();
        buffer.append(Action::text("user-1", "hi")).expect("append");
        assert_eq!(buffer.drain().expect("drain").len(), 1);
        assert!(buffer.is_empty());
        assert!(buffer.drain().expect("second drain").is_empty());
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        let buffer = Arc::new(TurnBuffer::new());
        let mut handles = Vec::new();
        for producer in 0..4 {
            let buffer = Arc::clone(&buffer);
            handles.push(std::thread::spawn(move || {
                for index in 0..50 {
                    buffer
                        .append(Action::text("user-1", format!("p{producer}-{index}")))
                        .expect("append");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("producer thread");
        }
        assert_eq!(buffer.len(), 200);
    }
}
