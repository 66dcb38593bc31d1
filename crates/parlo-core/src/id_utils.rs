use std::sync::atomic::{AtomicU64, Ordering};

use crate::time_utils::current_unix_timestamp_ms;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns a process-unique identifier with the given prefix.
///
/// Combines the wall clock with a monotonic counter so two ids minted in the
/// same millisecond stay distinct.
pub fn next_event_id(prefix: &str) -> String {
    let sequence = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", current_unix_timestamp_ms())
}

/// Returns a process-unique turn identifier.
pub fn next_turn_id() -> String {
    next_event_id("turn")
}
