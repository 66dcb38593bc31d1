//! Built-in echo engine for local runs and smoke tests.
//!
//! Stands in for a real dialogue engine behind the same interface: it
//! answers every inbound turn with one text action echoing the user input.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use parlo_channels::{DialogueEngine, InboundTurnRequest, TurnEmitter};
use parlo_core::is_blank;
use parlo_turn::Action;

pub struct EchoEngine;

#[async_trait]
impl DialogueEngine for EchoEngine {
    async fn handle_turn(
        &self,
        request: InboundTurnRequest,
        emitter: Arc<TurnEmitter>,
    ) -> Result<()> {
        let reply = if is_blank(&request.text) {
            "Say something and I will repeat it.".to_string()
        } else {
            format!("You said: {}", request.text.trim())
        };
        emitter.emit(Action::text(&request.recipient_id, reply).as_last_of_turn());
        Ok(())
    }
}
