//! End-to-end turn flows across the gateway, connectors, and coordinator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use httpmock::Method::POST;
use httpmock::MockServer;
use tokio::net::TcpListener;

use parlo_channels::{DialogueEngine, InboundTurnRequest, TurnEmitter, TurnRuntimeConfig};
use parlo_channels::PushClientConfig;
use parlo_gateway::{build_gateway_router, ApplicationBinding, GatewayConfig, GatewayState};
use parlo_turn::Action;

/// Emits a staged reply: two texts (with a delay hint), a card, a final text.
struct StoryEngine;

#[async_trait]
impl DialogueEngine for StoryEngine {
    async fn handle_turn(
        &self,
        request: InboundTurnRequest,
        emitter: Arc<TurnEmitter>,
    ) -> Result<()> {
        let user = &request.recipient_id;
        emitter.emit(Action::text(user, "Welcome back"));
        emitter.emit(Action::text(user, "how can I help?").with_delay_ms(400));
        emitter.emit(Action::card(
            user,
            parlo_turn::CardFragment {
                title: "Popular topics".to_string(),
                body: "Timetables, bookings, refunds".to_string(),
                ..Default::default()
            },
        ));
        emitter.emit(Action::text(user, "Pick one to continue.").as_last_of_turn());
        Ok(())
    }
}

struct SlowEngine;

#[async_trait]
impl DialogueEngine for SlowEngine {
    async fn handle_turn(
        &self,
        _request: InboundTurnRequest,
        _emitter: Arc<TurnEmitter>,
    ) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

async fn spawn_gateway(config: GatewayConfig, engine: Arc<dyn DialogueEngine>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let local_addr = listener.local_addr().expect("local addr");
    let state = Arc::new(GatewayState::new(&config, engine).expect("gateway state"));
    let router = build_gateway_router(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{local_addr}")
}

fn demo_config() -> GatewayConfig {
    GatewayConfig {
        applications: vec![ApplicationBinding {
            application_id: "demo".to_string(),
            target_bot_id: "314159".to_string(),
        }],
        ..GatewayConfig::default()
    }
}

#[tokio::test]
async fn webchat_sync_turn_merges_texts_and_keeps_card_separate() {
    let base = spawn_gateway(demo_config(), Arc::new(StoryEngine)).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/connect/webchat/demo"))
        .json(&serde_json::json!({
            "conversation_id": "conv-100",
            "sender_id": "user-100",
            "text": "hello",
            "conversation_token": "token-100",
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");

    assert_eq!(body["conversation_token"], "token-100");
    assert_eq!(body["continues_conversation"], true);
    let responses = body["responses"].as_array().expect("responses");
    // texts 1+2 merge (with the 400ms pause marker), the card breaks the
    // run, and the trailing text stays its own fragment
    assert_eq!(responses.len(), 3);
    assert_eq!(
        responses[0]["payload"]["text"],
        "Welcome back <break time=\"400ms\"/> how can I help?"
    );
    assert_eq!(responses[1]["kind"], "card");
    assert_eq!(responses[2]["payload"]["text"], "Pick one to continue.");
}

#[tokio::test]
async fn slow_engine_turn_is_forced_to_the_default_error_answer() {
    let config = GatewayConfig {
        turn: TurnRuntimeConfig {
            turn_timeout_ms: 200,
            ..TurnRuntimeConfig::default()
        },
        ..demo_config()
    };
    let base = spawn_gateway(config, Arc::new(SlowEngine)).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/connect/webchat/demo"))
        .json(&serde_json::json!({
            "conversation_id": "conv-200",
            "sender_id": "user-200",
            "text": "anyone there?",
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json");
    let responses = body["responses"].as_array().expect("responses");
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0]["payload"]["text"],
        "Sorry, a technical error occurred. Please try again."
    );
}

#[tokio::test]
async fn messenger_turn_acknowledges_then_pushes_each_fragment() {
    let push_server = MockServer::start();
    let push_mock = push_server.mock(|when, then| {
        when.method(POST)
            .path("/conversations/conv-300/messages")
            .body_includes("\"target_bot_id\":\"314159\"");
        then.status(200);
    });

    let config = GatewayConfig {
        push: Some(PushClientConfig {
            api_base: push_server.base_url(),
            retry_delay_ms: 1,
            ..PushClientConfig::default()
        }),
        ..demo_config()
    };
    let base = spawn_gateway(config, Arc::new(StoryEngine)).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/connect/messenger/demo"))
        .json(&serde_json::json!({
            "conversation_id": "conv-300",
            "sender_id": "4242424242",
            "text": "hi",
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let ack: serde_json::Value = response.json().await.expect("json");
    assert_eq!(ack, serde_json::json!({}), "immediate empty acknowledgement");

    // StoryEngine composes into three fragments; each gets its own push call.
    let mut calls = 0;
    for _ in 0..200 {
        calls = push_mock.calls();
        if calls == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn push_failures_do_not_stop_remaining_fragments() {
    let push_server = MockServer::start();
    // The card fragment is rejected outright; texts go through.
    let reject_cards = push_server.mock(|when, then| {
        when.method(POST)
            .path("/conversations/conv-400/messages")
            .body_includes("\"kind\":\"card\"");
        then.status(403);
    });
    let accept_texts = push_server.mock(|when, then| {
        when.method(POST)
            .path("/conversations/conv-400/messages")
            .body_includes("\"kind\":\"text\"");
        then.status(200);
    });

    let config = GatewayConfig {
        push: Some(PushClientConfig {
            api_base: push_server.base_url(),
            retry_delay_ms: 1,
            ..PushClientConfig::default()
        }),
        ..demo_config()
    };
    let base = spawn_gateway(config, Arc::new(StoryEngine)).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/connect/messenger/demo"))
        .json(&serde_json::json!({
            "conversation_id": "conv-400",
            "sender_id": "777000777",
            "text": "hi",
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);

    let mut delivered = 0;
    for _ in 0..200 {
        delivered = accept_texts.calls();
        if delivered == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(delivered, 2, "both text fragments still delivered");
    assert_eq!(reject_cards.calls(), 1, "card rejected once, no retry");
}
