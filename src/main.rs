//! Dice: a dice-rolling HTTP service instrumented with OpenTelemetry.
//!
//! # Usage
//!
//! ```bash
//! dice --port 8080 --otel-endpoint http://localhost:4317
//! ```
//!
//! Environment variables can also be used:
//! - `DICE_PORT`: Port to listen on
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector endpoint (export disabled when unset)
//! - `OTEL_EXPORTER_OTLP_PROTOCOL`: `grpc` or `http/protobuf`
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use dice::config::Config;
use dice::observability::tracing::init_tracing;
use dice::server::run_server;
use dice::shutdown::wait_for_interrupt;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

/// Print startup banner with version and configuration.
fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        r#"
   ____  _
  |  _ \(_) ___ ___
  | | | | |/ __/ _ \
  | |_| | | (_|  __/
  |____/|_|\___\___|

  Dice v{} - traced dice roller

  Configuration:
    Address:    {}:{}
    Service:    {} {}
    Collector:  {}
    Log Level:  {}

  Press Ctrl+C to shutdown gracefully.
"#,
        version,
        config.host,
        config.port,
        config.service_name,
        config.service_version,
        config.otel_endpoint.as_deref().unwrap_or("(none)"),
        config.log_level
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration from CLI arguments and environment
    let config = Config::parse_args();

    // Initialize logging
    let log_bridge = init_tracing(&config.service_name, &config.log_level, config.log_format);

    print_banner(&config);

    // Interrupt cancels the token; server and shutdown sequence observe it
    let shutdown_token = CancellationToken::new();
    tokio::spawn(wait_for_interrupt(shutdown_token.clone()));

    match run_server(config, Some(log_bridge), shutdown_token).await {
        Ok(()) => {
            tracing::info!("Dice shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Dice exited with error");
            ExitCode::FAILURE
        }
    }
}
