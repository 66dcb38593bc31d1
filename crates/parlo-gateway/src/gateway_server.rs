//! Gateway router, webhook handlers, and server bootstrap.
//!
//! Connector wiring is built once from an explicit [`GatewayConfig`] passed
//! by reference; there is no process-wide mutable application registry.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, warn};

use parlo_channels::{
    ConnectorRuntime, DialogueEngine, InboundTurnRequest, MessengerConnector, MessengerTurnReply,
    PushClient, PushClientConfig, TurnRuntimeConfig, VoiceConnector, WebchatConnector,
    WebchatTurnReply,
};
use parlo_turn::{StreamFrame, StreamHub, TurnSessionRegistry};

pub const DEFAULT_GATEWAY_BIND: &str = "127.0.0.1:8086";
pub const DEFAULT_STREAM_KEEPALIVE_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
/// One connector application: inbound path segment plus push routing id.
pub struct ApplicationBinding {
    pub application_id: String,
    #[serde(default)]
    pub target_bot_id: String,
}

#[derive(Debug, Clone)]
/// Everything the gateway needs, resolved before the server starts.
pub struct GatewayConfig {
    pub bind: String,
    pub stream_keepalive_secs: u64,
    pub turn: TurnRuntimeConfig,
    /// Absent means out-of-band connectors are not served.
    pub push: Option<PushClientConfig>,
    pub applications: Vec<ApplicationBinding>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_GATEWAY_BIND.to_string(),
            stream_keepalive_secs: DEFAULT_STREAM_KEEPALIVE_SECS,
            turn: TurnRuntimeConfig::default(),
            push: None,
            applications: Vec::new(),
        }
    }
}

/// Shared handler state: connectors plus the application map.
pub struct GatewayState {
    webchat: WebchatConnector,
    voice: VoiceConnector,
    messenger: Option<MessengerConnector>,
    stream_hub: Arc<StreamHub>,
    applications: BTreeMap<String, ApplicationBinding>,
    stream_keepalive: Duration,
}

impl GatewayState {
    pub fn new(config: &GatewayConfig, engine: Arc<dyn DialogueEngine>) -> Result<Self> {
        let registry = Arc::new(TurnSessionRegistry::new());
        let runtime = Arc::new(ConnectorRuntime::new(
            registry,
            engine,
            config.turn.clone(),
        ));
        let stream_hub = Arc::new(StreamHub::new());

        let messenger = match &config.push {
            Some(push_config) => {
                let push = Arc::new(
                    PushClient::new(push_config.clone())
                        .context("failed to initialize out-of-band push client")?,
                );
                Some(MessengerConnector::new(Arc::clone(&runtime), push))
            }
            None => None,
        };

        let applications = config
            .applications
            .iter()
            .map(|binding| (binding.application_id.clone(), binding.clone()))
            .collect();

        Ok(Self {
            webchat: WebchatConnector::new(Arc::clone(&runtime), Arc::clone(&stream_hub)),
            voice: VoiceConnector::new(runtime),
            messenger,
            stream_hub,
            applications,
            stream_keepalive: Duration::from_secs(config.stream_keepalive_secs),
        })
    }

    fn binding(&self, application_id: &str) -> Option<&ApplicationBinding> {
        self.applications.get(application_id)
    }
}

/// Canonical inbound webhook body, already parsed by the platform layer.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayInboundBody {
    pub conversation_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub conversation_token: String,
    #[serde(default)]
    pub stream: bool,
}

impl GatewayInboundBody {
    fn into_request(self, binding: &ApplicationBinding) -> InboundTurnRequest {
        let mut external_parameters = BTreeMap::new();
        external_parameters.insert(
            "application_id".to_string(),
            binding.application_id.clone(),
        );
        if !binding.target_bot_id.is_empty() {
            external_parameters.insert("target_bot_id".to_string(), binding.target_bot_id.clone());
        }
        InboundTurnRequest {
            application_id: binding.application_id.clone(),
            conversation_id: self.conversation_id,
            recipient_id: self.sender_id,
            text: self.text,
            conversation_token: self.conversation_token,
            supports_streaming: self.stream,
            external_parameters,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub recipient_id: String,
}

fn unknown_application(application_id: &str) -> Response {
    warn!(application_id, "webhook for unknown application");
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "unknown application" })),
    )
        .into_response()
}

fn internal_error(conversation_id: &str, error: &anyhow::Error) -> Response {
    error!(conversation_id, %error, "turn handling failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "turn handling failed" })),
    )
        .into_response()
}

async fn handle_webchat(
    State(state): State<Arc<GatewayState>>,
    Path(application_id): Path<String>,
    Json(body): Json<GatewayInboundBody>,
) -> Response {
    let Some(binding) = state.binding(&application_id) else {
        return unknown_application(&application_id);
    };
    let request = body.into_request(binding);
    match state.webchat.handle_inbound(&request).await {
        Ok(WebchatTurnReply::Sync(envelope)) => Json(envelope).into_response(),
        Ok(WebchatTurnReply::Streamed {
            subscribers_reached,
        }) => Json(json!({
            "status": "streaming",
            "subscribers_reached": subscribers_reached,
        }))
        .into_response(),
        Err(error) => internal_error(&request.conversation_id, &error),
    }
}

async fn handle_webchat_stream(
    State(state): State<Arc<GatewayState>>,
    Path(application_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    if state.binding(&application_id).is_none() {
        return unknown_application(&application_id);
    }
    let subscription = state.stream_hub.subscribe(&query.recipient_id);
    let stream = UnboundedReceiverStream::new(subscription.receiver)
        .map(|frame| Ok::<Event, Infallible>(stream_frame_event(frame)));
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.stream_keepalive)
                .text("ping"),
        )
        .into_response()
}

async fn handle_voice(
    State(state): State<Arc<GatewayState>>,
    Path(application_id): Path<String>,
    Json(body): Json<GatewayInboundBody>,
) -> Response {
    let Some(binding) = state.binding(&application_id) else {
        return unknown_application(&application_id);
    };
    let request = body.into_request(binding);
    match state.voice.handle_inbound(&request).await {
        Ok(envelope) => Json(envelope).into_response(),
        Err(error) => internal_error(&request.conversation_id, &error),
    }
}

async fn handle_messenger(
    State(state): State<Arc<GatewayState>>,
    Path(application_id): Path<String>,
    Json(body): Json<GatewayInboundBody>,
) -> Response {
    let Some(binding) = state.binding(&application_id) else {
        return unknown_application(&application_id);
    };
    let Some(messenger) = &state.messenger else {
        warn!(application_id, "out-of-band push not configured");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "out-of-band push not configured" })),
        )
            .into_response();
    };
    let target_bot_id = binding.target_bot_id.clone();
    let request = body.into_request(binding);
    match messenger.handle_inbound(&request, &target_bot_id).await {
        // the empty body IS the immediate acknowledgement
        Ok(MessengerTurnReply::Acknowledged) => Json(json!({})).into_response(),
        Ok(MessengerTurnReply::SyncFallback(envelope)) => Json(envelope).into_response(),
        Err(error) => internal_error(&request.conversation_id, &error),
    }
}

async fn handle_healthcheck() -> StatusCode {
    StatusCode::OK
}

fn stream_frame_event(frame: StreamFrame) -> Event {
    let (name, payload) = match &frame {
        StreamFrame::Action(action) => ("action", serde_json::to_string(action)),
        StreamFrame::Completed(response) => ("completed", serde_json::to_string(response)),
    };
    match payload {
        Ok(data) => Event::default().event(name).data(data),
        Err(error) => {
            error!(%error, "failed to serialize stream frame");
            Event::default().event("error").data("{}")
        }
    }
}

pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/connect/webchat/{application_id}", post(handle_webchat))
        .route(
            "/connect/webchat/{application_id}/stream",
            get(handle_webchat_stream),
        )
        .route("/connect/voice/{application_id}", post(handle_voice))
        .route(
            "/connect/messenger/{application_id}",
            post(handle_messenger),
        )
        .route("/healthcheck", get(handle_healthcheck))
        .with_state(state)
}

/// Binds the configured address and serves until interrupted.
pub async fn run_gateway_server(
    config: GatewayConfig,
    engine: Arc<dyn DialogueEngine>,
) -> Result<()> {
    let bind_addr = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid gateway bind address '{}'", config.bind))?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway server on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;

    println!(
        "gateway listening: addr={local_addr} applications={}",
        config.applications.len()
    );

    let state = Arc::new(GatewayState::new(&config, engine)?);
    let app = build_gateway_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("gateway server exited unexpectedly")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use parlo_channels::TurnEmitter;
    use parlo_turn::Action;

    struct GreeterEngine;

    #[async_trait]
    impl DialogueEngine for GreeterEngine {
        async fn handle_turn(
            &self,
            request: InboundTurnRequest,
            emitter: Arc<TurnEmitter>,
        ) -> anyhow::Result<()> {
            emitter.emit(
                Action::text(&request.recipient_id, format!("echo: {}", request.text))
                    .as_last_of_turn(),
            );
            Ok(())
        }
    }

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            applications: vec![ApplicationBinding {
                application_id: "demo".to_string(),
                target_bot_id: "7".to_string(),
            }],
            ..GatewayConfig::default()
        }
    }

    async fn spawn_server(config: GatewayConfig) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let local_addr = listener.local_addr().expect("local addr");
        let state = Arc::new(GatewayState::new(&config, Arc::new(GreeterEngine)).expect("state"));
        let app = build_gateway_router(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{local_addr}")
    }

    #[tokio::test]
    async fn webchat_webhook_answers_with_merged_envelope() {
        let base = spawn_server(test_config()).await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/connect/webchat/demo"))
            .json(&serde_json::json!({
                "conversation_id": "conv-1",
                "sender_id": "user-1",
                "text": "hi",
                "conversation_token": "tok",
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["conversation_token"], "tok");
        assert_eq!(body["continues_conversation"], true);
        assert_eq!(body["responses"][0]["payload"]["text"], "echo: hi");
    }

    #[tokio::test]
    async fn voice_webhook_returns_rich_response_envelope() {
        let base = spawn_server(test_config()).await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/connect/voice/demo"))
            .json(&serde_json::json!({
                "conversation_id": "conv-2",
                "sender_id": "user-2",
                "text": "schedule",
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body["expect_user_response"], true);
        assert_eq!(
            body["rich_response"]["items"][0]["payload"]["text"],
            "echo: schedule"
        );
    }

    #[tokio::test]
    async fn unknown_application_is_rejected_with_404() {
        let base = spawn_server(test_config()).await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/connect/webchat/nope"))
            .json(&serde_json::json!({ "conversation_id": "conv-1" }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn messenger_without_push_config_is_unavailable() {
        let base = spawn_server(test_config()).await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/connect/messenger/demo"))
            .json(&serde_json::json!({
                "conversation_id": "conv-1",
                "sender_id": "12345",
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 503);
    }

    #[tokio::test]
    async fn messenger_with_push_config_acknowledges_immediately() {
        let push_server = httpmock::MockServer::start();
        let mock = push_server.mock(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/conversations/conv-9/messages");
            then.status(200);
        });

        let config = GatewayConfig {
            push: Some(PushClientConfig {
                api_base: push_server.base_url(),
                retry_delay_ms: 1,
                ..PushClientConfig::default()
            }),
            ..test_config()
        };
        let base = spawn_server(config).await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/connect/messenger/demo"))
            .json(&serde_json::json!({
                "conversation_id": "conv-9",
                "sender_id": "12345",
                "text": "hello",
            }))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.expect("json");
        assert_eq!(body, serde_json::json!({}));

        let mut calls = 0;
        for _ in 0..100 {
            calls = mock.calls();
            if calls >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn stream_endpoint_delivers_frames_for_streamed_turn() {
        let base = spawn_server(test_config()).await;
        let client = reqwest::Client::new();

        let sse_response = client
            .get(format!("{base}/connect/webchat/demo/stream"))
            .query(&[("recipient_id", "user-5")])
            .send()
            .await
            .expect("sse connect");
        assert_eq!(sse_response.status(), 200);

        // Give the subscription a moment to register before posting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let post_response = client
            .post(format!("{base}/connect/webchat/demo"))
            .json(&serde_json::json!({
                "conversation_id": "conv-5",
                "sender_id": "user-5",
                "text": "streamed hello",
                "stream": true,
            }))
            .send()
            .await
            .expect("post");
        assert_eq!(post_response.status(), 200);
        let ack: serde_json::Value = post_response.json().await.expect("json");
        assert_eq!(ack["status"], "streaming");
        assert_eq!(ack["subscribers_reached"], 1);

        let mut stream = sse_response.bytes_stream();
        let mut collected = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    collected.push_str(&String::from_utf8_lossy(&chunk));
                    if collected.contains("event: completed") {
                        break;
                    }
                }
                _ => break,
            }
        }
        assert!(collected.contains("event: action"), "got: {collected}");
        assert!(collected.contains("streamed hello"), "got: {collected}");
        assert!(collected.contains("event: completed"), "got: {collected}");
    }
}
