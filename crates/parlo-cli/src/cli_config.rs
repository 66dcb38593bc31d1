//! TOML configuration parsing for the gateway binary.
//!
//! Every section is optional; omitted values fall back to the library
//! defaults so an empty file (or no file at all) still yields a runnable
//! local configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use parlo_channels::{PushClientConfig, TurnRuntimeConfig};
use parlo_gateway::{
    ApplicationBinding, GatewayConfig, DEFAULT_GATEWAY_BIND, DEFAULT_STREAM_KEEPALIVE_SECS,
};

fn default_bind() -> String {
    DEFAULT_GATEWAY_BIND.to_string()
}

fn default_stream_keepalive_secs() -> u64 {
    DEFAULT_STREAM_KEEPALIVE_SECS
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_stream_keepalive_secs")]
    pub stream_keepalive_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            stream_keepalive_secs: default_stream_keepalive_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TurnSection {
    pub timeout_ms: Option<u64>,
    pub default_error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushSection {
    pub api_base: String,
    pub http_timeout_ms: Option<u64>,
    pub max_attempts: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ParloConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub turn: TurnSection,
    #[serde(default)]
    pub push: Option<PushSection>,
    #[serde(default, rename = "application")]
    pub applications: Vec<ApplicationBinding>,
}

pub fn parse_config_file(raw: &str) -> Result<ParloConfigFile> {
    toml::from_str(raw).context("failed to parse parlo configuration")
}

pub fn load_config_file(path: &Path) -> Result<ParloConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    parse_config_file(&raw)
}

/// Merges the parsed file with CLI overrides into the runtime configuration.
pub fn build_gateway_config(
    file: ParloConfigFile,
    bind_override: Option<String>,
    turn_timeout_override_ms: Option<u64>,
) -> GatewayConfig {
    let mut turn = TurnRuntimeConfig::default();
    if let Some(timeout_ms) = file.turn.timeout_ms {
        turn.turn_timeout_ms = timeout_ms;
    }
    if let Some(message) = file.turn.default_error_message {
        turn.default_error_message = message;
    }
    if let Some(timeout_ms) = turn_timeout_override_ms {
        turn.turn_timeout_ms = timeout_ms;
    }

    let push = file.push.map(|section| {
        let mut config = PushClientConfig {
            api_base: section.api_base,
            ..PushClientConfig::default()
        };
        if let Some(timeout_ms) = section.http_timeout_ms {
            config.http_timeout_ms = timeout_ms;
        }
        if let Some(max_attempts) = section.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(retry_delay_ms) = section.retry_delay_ms {
            config.retry_delay_ms = retry_delay_ms;
        }
        config
    });

    GatewayConfig {
        bind: bind_override.unwrap_or(file.server.bind),
        stream_keepalive_secs: file.server.stream_keepalive_secs,
        turn,
        push,
        applications: file.applications,
    }
}
