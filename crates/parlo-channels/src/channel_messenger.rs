//! Messenger-style connector: immediate acknowledgement, out-of-band send.
//!
//! The webhook is answered with an empty 200 as soon as the turn starts;
//! the composed fragments go out afterwards through the push API, one call
//! per fragment. Platform recipient ids are integer-like; anything else
//! cannot be addressed by the push API and falls back to sync delivery.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use parlo_turn::{compose, ComposePolicy, DeliveryDescriptor, DeliveryMode};

use crate::channel_connector::{log_compose_warnings, run_sync_turn, ConnectorRuntime};
use crate::channel_engine::InboundTurnRequest;
use crate::channel_push::PushClient;
use crate::channel_webchat::WebchatResponseEnvelope;

pub const MESSENGER_MAX_FRAGMENTS: usize = 10;

fn messenger_compose_policy() -> ComposePolicy {
    ComposePolicy {
        max_fragments: MESSENGER_MAX_FRAGMENTS,
        require_leading_text: false,
        dedupe_suggestions: true,
    }
}

/// Out-of-band delivery needs an integer-like platform recipient id.
pub fn recipient_supports_out_of_band(recipient_id: &str) -> bool {
    !recipient_id.is_empty() && recipient_id.chars().all(|c| c.is_ascii_digit())
}

#[derive(Debug, Clone, PartialEq)]
/// How the messenger webhook was answered.
pub enum MessengerTurnReply {
    /// Empty 200 sent; delivery continues out-of-band.
    Acknowledged,
    /// Recipient id not addressable by the push API; turn ran synchronously.
    SyncFallback(WebchatResponseEnvelope),
}

pub struct MessengerConnector {
    runtime: Arc<ConnectorRuntime>,
    push: Arc<PushClient>,
}

impl MessengerConnector {
    pub fn new(runtime: Arc<ConnectorRuntime>, push: Arc<PushClient>) -> Self {
        Self { runtime, push }
    }

    pub async fn handle_inbound(
        &self,
        request: &InboundTurnRequest,
        target_bot_id: &str,
    ) -> Result<MessengerTurnReply> {
        if !recipient_supports_out_of_band(&request.recipient_id) {
            warn!(
                conversation_id = %request.conversation_id,
                recipient_id = %request.recipient_id,
                "recipient id not integer-like; falling back to sync delivery"
            );
            return self.handle_sync_fallback(request).await;
        }

        // Routing parameters are captured now, at turn start, and travel
        // with the session rather than any global registry.
        let descriptor = DeliveryDescriptor {
            mode: DeliveryMode::OutOfBand,
            endpoint_context: Default::default(),
        }
        .with_context("conversation_id", &request.conversation_id)
        .with_context("target_bot_id", target_bot_id);

        let runtime = Arc::clone(&self.runtime);
        let push = Arc::clone(&self.push);
        let request = request.clone();
        tokio::spawn(async move {
            let outcome = match runtime.run_turn(&request, descriptor, None).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => return,
                Err(error) => {
                    warn!(
                        conversation_id = %request.conversation_id,
                        %error,
                        "out-of-band turn failed before flush"
                    );
                    return;
                }
            };
            let composition = compose(&outcome.actions, &messenger_compose_policy());
            log_compose_warnings(&request.conversation_id, &composition.warnings);
            // routing ids travel with the turn, not through any shared state
            let target_bot_id = outcome
                .endpoint_context
                .get("target_bot_id")
                .cloned()
                .unwrap_or_default();
            let pushed = push
                .push_turn(
                    &request.conversation_id,
                    &target_bot_id,
                    &composition.response,
                )
                .await;
            info!(
                conversation_id = %request.conversation_id,
                turn_id = %outcome.turn_id,
                delivered = pushed.delivered,
                failed = pushed.failed,
                "out-of-band turn delivery finished"
            );
        });

        Ok(MessengerTurnReply::Acknowledged)
    }

    async fn handle_sync_fallback(
        &self,
        request: &InboundTurnRequest,
    ) -> Result<MessengerTurnReply> {
        let response = run_sync_turn(&self.runtime, request, messenger_compose_policy()).await;
        Ok(MessengerTurnReply::SyncFallback(
            WebchatResponseEnvelope::from_response(&request.conversation_token, response),
        ))
    }
}
