//! Voice assistant connector: one merged rich response per webhook call.
//!
//! Voice platforms require the first rich-response item to be a plain
//! spoken/text fragment and reject duplicate suggestion chips, so the
//! compose policy here is the strictest of the connectors.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use parlo_turn::{ComposePolicy, ComposedFragment, ComposedResponse, Suggestion};

use crate::channel_connector::{run_sync_turn, ConnectorRuntime};
use crate::channel_engine::InboundTurnRequest;

pub const VOICE_MAX_FRAGMENTS: usize = 8;

fn voice_compose_policy() -> ComposePolicy {
    ComposePolicy {
        max_fragments: VOICE_MAX_FRAGMENTS,
        require_leading_text: true,
        dedupe_suggestions: true,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Items plus suggestion chips, merged for the voice platform.
pub struct VoiceRichResponse {
    pub items: Vec<ComposedFragment>,
    #[serde(default)]
    pub suggestions: Vec<Suggestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Synchronous voice webhook reply envelope.
pub struct VoiceResponseEnvelope {
    pub conversation_token: String,
    pub expect_user_response: bool,
    pub rich_response: VoiceRichResponse,
}

impl VoiceResponseEnvelope {
    pub fn from_response(conversation_token: &str, response: ComposedResponse) -> Self {
        Self {
            conversation_token: conversation_token.to_string(),
            expect_user_response: response.continues_conversation,
            rich_response: VoiceRichResponse {
                items: response.fragments,
                suggestions: response.suggestions,
            },
        }
    }
}

pub struct VoiceConnector {
    runtime: Arc<ConnectorRuntime>,
}

impl VoiceConnector {
    pub fn new(runtime: Arc<ConnectorRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn handle_inbound(
        &self,
        request: &InboundTurnRequest,
    ) -> Result<VoiceResponseEnvelope> {
        let response = run_sync_turn(&self.runtime, request, voice_compose_policy()).await;
        Ok(VoiceResponseEnvelope::from_response(
            &request.conversation_token,
            response,
        ))
    }
}
