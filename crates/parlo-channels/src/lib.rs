//! Channel connectors wiring the dialogue engine to delivery transports.
//!
//! Provides the engine-facing turn interface, the shared connector runtime
//! (session lifecycle, timeout watchdog, flush), the out-of-band push client,
//! and the per-platform connectors (webchat, voice assistant, messenger).

pub mod channel_connector;
pub mod channel_engine;
pub mod channel_messenger;
pub mod channel_push;
pub mod channel_voice;
pub mod channel_webchat;

pub use channel_connector::*;
pub use channel_engine::*;
pub use channel_messenger::*;
pub use channel_push::*;
pub use channel_voice::*;
pub use channel_webchat::*;
