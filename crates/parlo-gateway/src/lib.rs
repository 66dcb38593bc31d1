//! HTTP surface for the Parlo channel connectors.
//!
//! Exposes webhook routes per connector, the SSE subscription endpoint for
//! streamed webchat turns, and the server bootstrap. Signature/secret
//! verification of platform webhooks happens upstream of these routes.

pub mod gateway_server;

pub use gateway_server::*;
