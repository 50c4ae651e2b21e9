//! Command-line surface.

use clap::Parser;
use std::path::PathBuf;

/// Bridge between a Modbus RTU fleet tunneled over MQTT and a
/// home-automation discovery/state broker.
#[derive(Debug, Parser)]
#[command(name = "modbus-gateway-bridge", version, about)]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(default_value = "config.yaml")]
    pub config: PathBuf,

    /// Run a one-shot connectivity probe against the broker and exit.
    #[arg(long)]
    pub diagnostic: bool,

    /// Log level filter (overridden by `RUST_LOG` if set).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Optional address to serve `/health` and `/metrics` on, e.g. `0.0.0.0:9090`.
    #[arg(long)]
    pub http_addr: Option<String>,
}
