//! Shared connector runtime: session lifecycle, engine dispatch, watchdog.
//!
//! Every platform connector drives a turn through `run_turn`: obtain the
//! conversation's session, latch the start side effect, dispatch the engine
//! on its own task, then wait for the first of (a) the last-of-turn signal,
//! (b) engine task completion, (c) the timeout watchdog. All three paths
//! funnel into the completion gate, so exactly one of them flushes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tracing::warn;

use parlo_turn::{
    compose, Action, ComposePolicy, ComposeWarning, ComposedResponse, DeliveryDescriptor,
    EndReason, StreamHub, SyncResponder, TurnSessionRegistry,
};

use crate::channel_engine::{DialogueEngine, InboundTurnRequest, TurnEmitter};

pub const DEFAULT_TURN_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_ERROR_MESSAGE: &str = "Sorry, a technical error occurred. Please try again.";

#[derive(Debug, Clone)]
/// Turn execution knobs shared by every connector.
pub struct TurnRuntimeConfig {
    pub turn_timeout_ms: u64,
    /// Delivered through `force_end` so the user never sees a hung turn.
    pub default_error_message: String,
}

impl Default for TurnRuntimeConfig {
    fn default() -> Self {
        Self {
            turn_timeout_ms: DEFAULT_TURN_TIMEOUT_MS,
            default_error_message: DEFAULT_ERROR_MESSAGE.to_string(),
        }
    }
}

#[derive(Debug)]
/// The flushed result of a turn, handed to the connector for composition.
pub struct TurnOutcome {
    pub actions: Vec<Action>,
    pub reason: EndReason,
    pub turn_id: String,
    /// Routing parameters captured when the turn started.
    pub endpoint_context: BTreeMap<String, String>,
}

/// Session registry + engine + config, shared across connectors.
pub struct ConnectorRuntime {
    registry: Arc<TurnSessionRegistry>,
    engine: Arc<dyn DialogueEngine>,
    config: TurnRuntimeConfig,
}

impl ConnectorRuntime {
    pub fn new(
        registry: Arc<TurnSessionRegistry>,
        engine: Arc<dyn DialogueEngine>,
        config: TurnRuntimeConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &TurnRuntimeConfig {
        &self.config
    }

    fn error_action(&self, request: &InboundTurnRequest) -> Action {
        Action::text(&request.recipient_id, &self.config.default_error_message).as_last_of_turn()
    }

    /// Runs one turn to its end transition.
    ///
    /// Returns `Ok(None)` when another trigger won the flush race for the
    /// same session — the caller must not deliver anything in that case.
    pub async fn run_turn(
        &self,
        request: &InboundTurnRequest,
        delivery: DeliveryDescriptor,
        stream: Option<Arc<StreamHub>>,
    ) -> Result<Option<TurnOutcome>> {
        let session = self.registry.obtain(
            &request.conversation_id,
            delivery,
            request.external_parameters.clone(),
        )?;
        session.start();

        let completion = Arc::new(Notify::new());
        let emitter = Arc::new(TurnEmitter::new(
            Arc::clone(&session),
            stream,
            Arc::clone(&completion),
        ));
        let engine = Arc::clone(&self.engine);
        let engine_request = request.clone();
        let mut engine_task =
            tokio::spawn(async move { engine.handle_turn(engine_request, emitter).await });

        let timeout = Duration::from_millis(self.config.turn_timeout_ms);
        let (drained, reason) = tokio::select! {
            _ = completion.notified() => (session.end(), EndReason::Completed),
            joined = &mut engine_task => match joined {
                Ok(Ok(())) => (session.end(), EndReason::Completed),
                Ok(Err(error)) => {
                    warn!(
                        conversation_id = %request.conversation_id,
                        turn_id = session.turn_id(),
                        %error,
                        "dialogue engine failed; forcing turn end"
                    );
                    (
                        session.force_end(Some(self.error_action(request))),
                        EndReason::ForcedError,
                    )
                }
                Err(join_error) => {
                    warn!(
                        conversation_id = %request.conversation_id,
                        turn_id = session.turn_id(),
                        %join_error,
                        "dialogue engine task aborted; forcing turn end"
                    );
                    (
                        session.force_end(Some(self.error_action(request))),
                        EndReason::ForcedError,
                    )
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    conversation_id = %request.conversation_id,
                    turn_id = session.turn_id(),
                    timeout_ms = self.config.turn_timeout_ms,
                    "turn timed out; forcing end"
                );
                (
                    session.force_end(Some(self.error_action(request))),
                    EndReason::ForcedTimeout,
                )
            }
        };

        let turn_id = session.turn_id().to_string();
        self.registry.release(&request.conversation_id, &turn_id);

        let endpoint_context = session.delivery().endpoint_context.clone();
        Ok(drained.map(|actions| TurnOutcome {
            actions,
            reason,
            turn_id,
            endpoint_context,
        }))
    }
}

/// Runs one synchronous turn and completes the pending response through a
/// [`SyncResponder`], so every termination path funnels into the same
/// exactly-once completion. Returns the composed response the still-open
/// HTTP connection should carry.
pub async fn run_sync_turn(
    runtime: &Arc<ConnectorRuntime>,
    request: &InboundTurnRequest,
    policy: ComposePolicy,
) -> ComposedResponse {
    let (responder, receiver) = SyncResponder::new(&request.conversation_id);
    let task_runtime = Arc::clone(runtime);
    let task_request = request.clone();
    // The responder moves into the task: if the turn lost the flush race the
    // dropped sender resolves the pending receiver instead of hanging it.
    tokio::spawn(async move {
        match task_runtime
            .run_turn(&task_request, DeliveryDescriptor::sync(), None)
            .await
        {
            Ok(Some(outcome)) => {
                let composition = compose(&outcome.actions, &policy);
                log_compose_warnings(&task_request.conversation_id, &composition.warnings);
                responder.complete(composition.response);
            }
            // another trigger flushed this turn; its winner delivers
            Ok(None) => {}
            Err(error) => {
                warn!(
                    conversation_id = %task_request.conversation_id,
                    %error,
                    "turn failed before delivery; answering continuation"
                );
                responder.complete(ComposedResponse::continuation());
            }
        }
    });
    match receiver.await {
        Ok(response) => response,
        Err(_) => {
            warn!(
                conversation_id = %request.conversation_id,
                "turn ended without completing the pending response"
            );
            ComposedResponse::continuation()
        }
    }
}

/// Reports composition findings the way operators expect to see them.
pub fn log_compose_warnings(conversation_id: &str, warnings: &[ComposeWarning]) {
    for warning in warnings {
        warn!(conversation_id, %warning, "response composition warning");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use anyhow::bail;
    use async_trait::async_trait;

    use super::*;
    use parlo_turn::{ActionPayload, DeliveryMode};

    struct ScriptedEngine {
        texts: Vec<&'static str>,
        flag_last: bool,
    }

    #[async_trait]
    impl DialogueEngine for ScriptedEngine {
        async fn handle_turn(
            &self,
            request: InboundTurnRequest,
            emitter: Arc<TurnEmitter>,
        ) -> Result<()> {
            for (index, text) in self.texts.iter().enumerate() {
                let mut action = Action::text(&request.recipient_id, *text);
                if self.flag_last && index == self.texts.len() - 1 {
                    action = action.as_last_of_turn();
                }
                emitter.emit(action);
            }
            Ok(())
        }
    }

    struct FailingEngine;

    #[async_trait]
    impl DialogueEngine for FailingEngine {
        async fn handle_turn(
            &self,
            _request: InboundTurnRequest,
            _emitter: Arc<TurnEmitter>,
        ) -> Result<()> {
            bail!("story resolution failed");
        }
    }

    struct HangingEngine;

    #[async_trait]
    impl DialogueEngine for HangingEngine {
        async fn handle_turn(
            &self,
            request: InboundTurnRequest,
            emitter: Arc<TurnEmitter>,
        ) -> Result<()> {
            emitter.emit(Action::text(&request.recipient_id, "partial"));
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn request() -> InboundTurnRequest {
        InboundTurnRequest {
            application_id: "app-1".to_string(),
            conversation_id: "conv-1".to_string(),
            recipient_id: "user-1".to_string(),
            text: "hi".to_string(),
            conversation_token: String::new(),
            supports_streaming: false,
            external_parameters: BTreeMap::new(),
        }
    }

    fn runtime(engine: Arc<dyn DialogueEngine>, timeout_ms: u64) -> ConnectorRuntime {
        ConnectorRuntime::new(
            Arc::new(TurnSessionRegistry::new()),
            engine,
            TurnRuntimeConfig {
                turn_timeout_ms: timeout_ms,
                ..TurnRuntimeConfig::default()
            },
        )
    }

    fn texts(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .map(|action| match &action.payload {
                ActionPayload::Text(fragment) => fragment.text.clone(),
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn natural_completion_drains_in_order() {
        let runtime = runtime(
            Arc::new(ScriptedEngine {
                texts: vec!["one", "two", "three"],
                flag_last: true,
            }),
            5_000,
        );
        let outcome = runtime
            .run_turn(&request(), DeliveryDescriptor::sync(), None)
            .await
            .expect("run")
            .expect("flush winner");
        assert_eq!(outcome.reason, EndReason::Completed);
        assert_eq!(texts(&outcome.actions), vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn engine_return_without_last_flag_still_completes() {
        let runtime = runtime(
            Arc::new(ScriptedEngine {
                texts: vec!["only"],
                flag_last: false,
            }),
            5_000,
        );
        let outcome = runtime
            .run_turn(&request(), DeliveryDescriptor::sync(), None)
            .await
            .expect("run")
            .expect("flush winner");
        assert_eq!(outcome.reason, EndReason::Completed);
        assert_eq!(texts(&outcome.actions), vec!["only"]);
    }

    #[tokio::test]
    async fn engine_failure_appends_default_error_action() {
        let runtime = runtime(Arc::new(FailingEngine), 5_000);
        let outcome = runtime
            .run_turn(&request(), DeliveryDescriptor::sync(), None)
            .await
            .expect("run")
            .expect("flush winner");
        assert_eq!(outcome.reason, EndReason::ForcedError);
        assert_eq!(texts(&outcome.actions), vec![DEFAULT_ERROR_MESSAGE]);
    }

    #[tokio::test]
    async fn hanging_engine_is_force_ended_with_partial_buffer() {
        let runtime = runtime(Arc::new(HangingEngine), 100);
        let outcome = runtime
            .run_turn(&request(), DeliveryDescriptor::sync(), None)
            .await
            .expect("run")
            .expect("flush winner");
        assert_eq!(outcome.reason, EndReason::ForcedTimeout);
        assert_eq!(texts(&outcome.actions), vec!["partial", DEFAULT_ERROR_MESSAGE]);
    }

    #[tokio::test]
    async fn run_sync_turn_completes_the_pending_response_once() {
        let runtime = Arc::new(runtime(
            Arc::new(ScriptedEngine {
                texts: vec!["merged", "reply"],
                flag_last: true,
            }),
            5_000,
        ));
        let response = run_sync_turn(&runtime, &request(), ComposePolicy::default()).await;
        assert!(response.continues_conversation);
        assert_eq!(response.fragments.len(), 1);
    }

    #[tokio::test]
    async fn delivery_descriptor_reaches_the_session() {
        let registry = Arc::new(TurnSessionRegistry::new());
        let runtime = ConnectorRuntime::new(
            Arc::clone(&registry),
            Arc::new(ScriptedEngine {
                texts: vec!["hi"],
                flag_last: true,
            }),
            TurnRuntimeConfig::default(),
        );
        let descriptor = DeliveryDescriptor {
            mode: DeliveryMode::OutOfBand,
            endpoint_context: BTreeMap::from([(
                "target_bot_id".to_string(),
                "42".to_string(),
            )]),
        };
        let outcome = runtime
            .run_turn(&request(), descriptor, None)
            .await
            .expect("run")
            .expect("flush winner");
        assert!(!outcome.actions.is_empty());
        assert_eq!(
            outcome.endpoint_context.get("target_bot_id").map(String::as_str),
            Some("42"),
            "routing context captured at start survives to the flush"
        );
        assert_eq!(registry.live_count(), 0, "session released after flush");
    }
}
