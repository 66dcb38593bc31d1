//! Webchat (browser widget) connector: synchronous JSON or server-push.
//!
//! Sync callers receive the whole composed turn in one envelope; stream
//! callers get each action as its own frame plus a final completed frame,
//! while the inbound POST is acknowledged right away.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use parlo_turn::{
    compose, ComposePolicy, ComposedFragment, ComposedResponse, DeliveryDescriptor, DeliveryMode,
    StreamFrame, StreamHub, Suggestion,
};

use crate::channel_connector::{log_compose_warnings, run_sync_turn, ConnectorRuntime};
use crate::channel_engine::InboundTurnRequest;

pub const WEBCHAT_MAX_FRAGMENTS: usize = 10;

fn webchat_compose_policy() -> ComposePolicy {
    ComposePolicy {
        max_fragments: WEBCHAT_MAX_FRAGMENTS,
        require_leading_text: false,
        dedupe_suggestions: true,
    }
}

/// Synchronous webchat reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebchatResponseEnvelope {
    pub conversation_token: String,
    pub continues_conversation: bool,
    pub responses: Vec<ComposedFragment>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
}

impl WebchatResponseEnvelope {
    pub fn from_response(conversation_token: &str, response: ComposedResponse) -> Self {
        Self {
            conversation_token: conversation_token.to_string(),
            continues_conversation: response.continues_conversation,
            responses: response.fragments,
            suggestions: response.suggestions,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// How the webchat turn was answered.
pub enum WebchatTurnReply {
    Sync(WebchatResponseEnvelope),
    /// Turn ran in stream mode; frames went to the subscribers, the POST
    /// gets this acknowledgement envelope.
    Streamed { subscribers_reached: usize },
}

pub struct WebchatConnector {
    runtime: Arc<ConnectorRuntime>,
    stream_hub: Arc<StreamHub>,
}

impl WebchatConnector {
    pub fn new(runtime: Arc<ConnectorRuntime>, stream_hub: Arc<StreamHub>) -> Self {
        Self {
            runtime,
            stream_hub,
        }
    }

    pub fn stream_hub(&self) -> &Arc<StreamHub> {
        &self.stream_hub
    }

    pub async fn handle_inbound(&self, request: &InboundTurnRequest) -> Result<WebchatTurnReply> {
        if request.supports_streaming {
            self.handle_streamed(request).await
        } else {
            self.handle_sync(request).await
        }
    }

    async fn handle_sync(&self, request: &InboundTurnRequest) -> Result<WebchatTurnReply> {
        let response = run_sync_turn(&self.runtime, request, webchat_compose_policy()).await;
        Ok(WebchatTurnReply::Sync(WebchatResponseEnvelope::from_response(
            &request.conversation_token,
            response,
        )))
    }

    async fn handle_streamed(&self, request: &InboundTurnRequest) -> Result<WebchatTurnReply> {
        let descriptor = DeliveryDescriptor {
            mode: DeliveryMode::Stream,
            endpoint_context: Default::default(),
        };
        let outcome = self
            .runtime
            .run_turn(request, descriptor, Some(Arc::clone(&self.stream_hub)))
            .await?;
        let subscribers_reached = match outcome {
            Some(outcome) => {
                let composition = compose(&outcome.actions, &webchat_compose_policy());
                log_compose_warnings(&request.conversation_id, &composition.warnings);
                let reached = self.stream_hub.publish(
                    &request.recipient_id,
                    &StreamFrame::Completed(composition.response),
                );
                debug!(
                    conversation_id = %request.conversation_id,
                    turn_id = %outcome.turn_id,
                    reached,
                    "streamed turn completed"
                );
                reached
            }
            None => 0,
        };
        Ok(WebchatTurnReply::Streamed {
            subscribers_reached,
        })
    }
}
