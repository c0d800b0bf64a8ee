//! OpenTelemetry observability infrastructure.
//!
//! Provides:
//! - Structured logging via `tracing`
//! - The telemetry pipeline (trace, metric and log providers with OTLP export)
//! - Metric instruments for dice rolls

pub mod metrics;
pub mod telemetry;
pub mod tracing;

pub use telemetry::{ExportProtocol, Telemetry, TelemetryConfig, TelemetryError};
