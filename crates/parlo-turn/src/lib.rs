//! Turn-response coordination building blocks for Parlo.
//!
//! Provides the action contract, per-turn buffering, the idempotent
//! completion gate, response composition, and the transport-agnostic
//! delivery primitives (synchronous responder, streaming fan-out hub).
//! Channel connectors wire these pieces to concrete platforms.
//!
//! ```rust
//! use parlo_turn::{Action, ComposePolicy, compose};
//!
//! let actions = vec![
//!     Action::text("user-1", "Hello"),
//!     Action::text("user-1", "there"),
//! ];
//! let composition = compose(&actions, &ComposePolicy::default());
//! assert_eq!(composition.response.fragments.len(), 1);
//! assert!(composition.response.continues_conversation);
//! ```

pub mod turn_buffer;
pub mod turn_compose;
pub mod turn_contract;
pub mod turn_delivery;
pub mod turn_gate;
pub mod turn_session;

pub use turn_buffer::*;
pub use turn_compose::*;
pub use turn_contract::*;
pub use turn_delivery::*;
pub use turn_gate::*;
pub use turn_session::*;
