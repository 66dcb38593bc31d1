//! Parlo gateway binary: config load, tracing bootstrap, serve loop.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod cli_args;
mod cli_config;
mod echo_engine;

use cli_args::Cli;
use cli_config::{build_gateway_config, load_config_file, ParloConfigFile};
use echo_engine::EchoEngine;
use parlo_gateway::run_gateway_server;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => ParloConfigFile::default(),
    };
    let config = build_gateway_config(file, cli.bind.clone(), cli.turn_timeout_ms);

    run_gateway_server(config, Arc::new(EchoEngine)).await
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
