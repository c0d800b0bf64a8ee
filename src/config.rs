//! Configuration parsing for the dice server.
//!
//! Supports:
//! - CLI arguments via clap
//! - Environment variable overrides (including the standard `OTEL_*` variables)
//! - Sensible defaults for quick start

use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Dice: a dice-rolling HTTP service instrumented with OpenTelemetry.
#[derive(Parser, Debug, Clone)]
#[command(name = "dice")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Host address to bind to
    #[arg(long, env = "DICE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "DICE_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "DICE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Service name reported in telemetry resources
    #[arg(long, env = "OTEL_SERVICE_NAME", default_value = "dice")]
    pub service_name: String,

    /// Service version reported in telemetry resources
    #[arg(long, env = "DICE_SERVICE_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub service_version: String,

    /// OpenTelemetry collector endpoint (traces and metrics are not exported when unset)
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,

    /// OTLP protocol: grpc or http/protobuf
    #[arg(long, env = "OTEL_EXPORTER_OTLP_PROTOCOL", default_value = "grpc")]
    pub otel_protocol: String,

    /// Timeout for a single OTLP export, in milliseconds
    #[arg(long, env = "OTEL_EXPORTER_OTLP_TIMEOUT", default_value_t = 10_000)]
    pub otel_timeout_ms: u64,

    /// Interval between metric exports, in milliseconds
    #[arg(long, env = "OTEL_METRIC_EXPORT_INTERVAL", default_value_t = 10_000)]
    pub metric_interval_ms: u64,

    /// Time allowed for a client to send request headers, in milliseconds
    #[arg(long, env = "DICE_READ_TIMEOUT_MS", default_value_t = 1_000)]
    pub read_timeout_ms: u64,

    /// Maximum time a single request may take, in milliseconds
    #[arg(long, env = "DICE_REQUEST_TIMEOUT_MS", default_value_t = 10_000)]
    pub request_timeout_ms: u64,

    /// Time allowed for in-flight requests to finish on shutdown, in milliseconds
    #[arg(long, env = "DICE_DRAIN_TIMEOUT_MS", default_value_t = 5_000)]
    pub drain_timeout_ms: u64,

    /// Time allowed for telemetry to flush on shutdown, in milliseconds
    #[arg(long, env = "DICE_FLUSH_TIMEOUT_MS", default_value_t = 5_000)]
    pub flush_timeout_ms: u64,
}

impl Config {
    /// Parse configuration from CLI arguments and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Address string the HTTP listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Create a configuration for tests: loopback, random port, no export.
    pub fn test_config() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0, // Random port
            log_level: "debug".into(),
            drain_timeout_ms: 1_000,
            flush_timeout_ms: 1_000,
            ..Self::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            log_level: "info".into(),
            log_format: LogFormat::Text,
            service_name: "dice".into(),
            service_version: env!("CARGO_PKG_VERSION").into(),
            otel_endpoint: None,
            otel_protocol: "grpc".into(),
            otel_timeout_ms: 10_000,
            metric_interval_ms: 10_000,
            read_timeout_ms: 1_000,
            request_timeout_ms: 10_000,
            drain_timeout_ms: 5_000,
            flush_timeout_ms: 5_000,
        }
    }
}
