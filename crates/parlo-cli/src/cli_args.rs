use std::path::PathBuf;

use clap::Parser;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "parlo",
    about = "Multi-channel turn-response coordinator for dialogue engines",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "PARLO_CONFIG",
        help = "Path to the TOML configuration file; defaults apply when omitted"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "PARLO_BIND",
        help = "Override the configured gateway bind address (host:port)"
    )]
    pub bind: Option<String>,

    #[arg(
        long = "turn-timeout-ms",
        env = "PARLO_TURN_TIMEOUT_MS",
        value_parser = parse_positive_u64,
        help = "Override the turn timeout watchdog in milliseconds"
    )]
    pub turn_timeout_ms: Option<u64>,
}
