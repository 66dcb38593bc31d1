//! Out-of-band delivery client for the external push API.
//!
//! One POST per composed fragment, carrying the routing parameters captured
//! at turn start. Failures are classified retryable versus terminal and
//! surfaced as per-fragment receipts; a failed fragment never stops the
//! remaining ones. Retryable failures get a bounded retry with a fixed
//! short delay — never an unbounded loop.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{redirect::Policy, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use parlo_turn::ComposedResponse;

pub const PUSH_DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;
pub const PUSH_DEFAULT_MAX_ATTEMPTS: usize = 2;
pub const PUSH_DEFAULT_RETRY_DELAY_MS: u64 = 150;

#[derive(Debug, Clone)]
/// Push API endpoint and retry knobs.
pub struct PushClientConfig {
    pub api_base: String,
    pub http_timeout_ms: u64,
    pub max_attempts: usize,
    pub retry_delay_ms: u64,
}

impl Default for PushClientConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            http_timeout_ms: PUSH_DEFAULT_HTTP_TIMEOUT_MS,
            max_attempts: PUSH_DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: PUSH_DEFAULT_RETRY_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Delivery record for one composed fragment.
pub struct PushReceipt {
    pub status: String,
    pub fragment_index: usize,
    pub fragment_count: usize,
    pub endpoint: String,
    pub attempts: usize,
    pub reason_code: Option<String>,
    pub detail: Option<String>,
    pub retryable: bool,
    pub http_status: Option<u16>,
}

#[derive(Debug, Clone)]
/// One failed delivery attempt, classified for the retry decision.
pub struct PushAttemptError {
    pub reason_code: String,
    pub detail: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
}

impl Display for PushAttemptError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reason_code={} retryable={} detail={}",
            self.reason_code, self.retryable, self.detail
        )
    }
}

impl std::error::Error for PushAttemptError {}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Aggregate result of pushing one turn's composed response.
pub struct PushOutcome {
    pub delivered: usize,
    pub failed: usize,
    pub receipts: Vec<PushReceipt>,
}

/// HTTP client for the external push API.
pub struct PushClient {
    config: PushClientConfig,
    client: reqwest::Client,
}

impl PushClient {
    pub fn new(config: PushClientConfig) -> Result<Self> {
        if config.api_base.trim().is_empty() {
            bail!("push api base url cannot be blank");
        }
        if config.max_attempts == 0 {
            bail!("push max attempts must be greater than 0");
        }
        if config.http_timeout_ms == 0 {
            bail!("push http timeout must be greater than 0");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .redirect(Policy::none())
            .build()
            .context("failed to build push http client")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, conversation_id: &str) -> String {
        format!(
            "{}/conversations/{conversation_id}/messages",
            self.config.api_base.trim_end_matches('/')
        )
    }

    /// Pushes every composed fragment, best-effort, one call per fragment.
    pub async fn push_turn(
        &self,
        conversation_id: &str,
        target_bot_id: &str,
        response: &ComposedResponse,
    ) -> PushOutcome {
        let endpoint = self.endpoint(conversation_id);
        let fragment_count = response.fragments.len();
        let mut receipts = Vec::with_capacity(fragment_count);
        let mut delivered = 0;
        let mut failed = 0;

        for (fragment_index, fragment) in response.fragments.iter().enumerate() {
            let body = json!({
                "conversation_id": conversation_id,
                "target_bot_id": target_bot_id,
                "message": fragment,
            });
            let receipt = self
                .push_fragment(&endpoint, &body, fragment_index, fragment_count)
                .await;
            if receipt.status == "delivered" {
                delivered += 1;
            } else {
                failed += 1;
                warn!(
                    conversation_id,
                    target_bot_id,
                    fragment_index,
                    fragment_count,
                    reason_code = receipt.reason_code.as_deref().unwrap_or("unknown"),
                    "out-of-band push failed; continuing with remaining fragments"
                );
            }
            receipts.push(receipt);
        }

        PushOutcome {
            delivered,
            failed,
            receipts,
        }
    }

    async fn push_fragment(
        &self,
        endpoint: &str,
        body: &Value,
        fragment_index: usize,
        fragment_count: usize,
    ) -> PushReceipt {
        let mut attempts = 0;
        let mut last_error: Option<PushAttemptError> = None;
        while attempts < self.config.max_attempts {
            attempts += 1;
            match self.send_once(endpoint, body).await {
                Ok(http_status) => {
                    debug!(endpoint, fragment_index, attempts, "out-of-band push delivered");
                    return PushReceipt {
                        status: "delivered".to_string(),
                        fragment_index,
                        fragment_count,
                        endpoint: endpoint.to_string(),
                        attempts,
                        reason_code: None,
                        detail: None,
                        retryable: false,
                        http_status: Some(http_status),
                    };
                }
                Err(error) => {
                    let retry = error.retryable && attempts < self.config.max_attempts;
                    debug!(
                        endpoint,
                        fragment_index,
                        attempts,
                        %error,
                        retry,
                        "out-of-band push attempt failed"
                    );
                    last_error = Some(error);
                    if !retry {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }

        let error = last_error.unwrap_or(PushAttemptError {
            reason_code: "push_no_attempt".to_string(),
            detail: "no delivery attempt executed".to_string(),
            retryable: false,
            http_status: None,
        });
        PushReceipt {
            status: "failed".to_string(),
            fragment_index,
            fragment_count,
            endpoint: endpoint.to_string(),
            attempts,
            reason_code: Some(error.reason_code),
            detail: Some(error.detail),
            retryable: error.retryable,
            http_status: error.http_status,
        }
    }

    async fn send_once(&self, endpoint: &str, body: &Value) -> Result<u16, PushAttemptError> {
        let response = self
            .client
            .post(endpoint)
            .json(body)
            .send()
            .await
            .map_err(|error| PushAttemptError {
                reason_code: "push_transport_error".to_string(),
                detail: error.to_string(),
                retryable: true,
                http_status: None,
            })?;
        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }
        let retryable = status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT;
        Err(PushAttemptError {
            reason_code: if retryable {
                "push_status_retryable".to_string()
            } else {
                "push_status_rejected".to_string()
            },
            detail: format!("push endpoint returned {status}"),
            retryable,
            http_status: Some(status.as_u16()),
        })
    }
}
