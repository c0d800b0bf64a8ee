//! Telemetry pipeline setup and teardown.
//!
//! Builds trace, metric and log providers for the service and bundles them
//! into a [`Telemetry`] context. No provider is registered globally: the
//! context is handed to the HTTP router, which creates spans and records
//! metrics through it, and log events reach the logger provider through the
//! [`LogBridge`] slot of the subscriber. When no collector endpoint is
//! configured, everything is still recorded but never exported.

use axum::http::{HeaderMap, Uri};
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::export::logs::LogExporter;
use opentelemetry_sdk::export::trace::SpanExporter;
use opentelemetry_sdk::logs::LoggerProvider;
use opentelemetry_sdk::metrics::{ManualReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self as sdktrace, Tracer, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use super::metrics::{DiceMetrics, SCOPE_NAME};
use super::tracing::LogBridge;
use crate::config::Config;

/// Error type for telemetry setup and teardown.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid telemetry configuration: {0}")]
    Configuration(String),

    #[error("Failed to build trace exporter: {0}")]
    TraceExporter(#[from] opentelemetry::trace::TraceError),

    #[error("Failed to build metrics exporter: {0}")]
    MetricsExporter(#[from] opentelemetry::metrics::MetricsError),

    #[error("Failed to build log exporter: {0}")]
    LogExporter(#[from] opentelemetry::logs::LogError),

    #[error("Failed to flush telemetry: {0}")]
    Flush(String),

    #[error("Telemetry flush did not finish within {0:?}")]
    FlushTimeout(Duration),
}

/// Wire protocol used to reach the OTLP collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportProtocol {
    /// OTLP over gRPC (port 4317 by convention)
    Grpc,
    /// OTLP over HTTP with protobuf bodies (port 4318 by convention)
    HttpProtobuf,
}

impl FromStr for ExportProtocol {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grpc" => Ok(Self::Grpc),
            "http/protobuf" | "http" => Ok(Self::HttpProtobuf),
            other => Err(TelemetryError::Configuration(format!(
                "unsupported OTLP protocol {other:?} (expected grpc or http/protobuf)"
            ))),
        }
    }
}

/// Settings for building the telemetry pipeline.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    /// Collector endpoint; `None` disables export.
    pub endpoint: Option<String>,
    pub protocol: ExportProtocol,
    pub export_timeout: Duration,
    pub metric_interval: Duration,
    /// Upper bound on the flush performed by [`Telemetry::shutdown`].
    pub flush_timeout: Duration,
}

impl TelemetryConfig {
    /// Derive telemetry settings from the server configuration.
    ///
    /// Validates the endpoint and protocol up front so misconfiguration is
    /// reported before any traffic is served.
    pub fn from_config(config: &Config) -> Result<Self, TelemetryError> {
        let endpoint = config
            .otel_endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(validate_endpoint)
            .transpose()?;

        Ok(Self {
            service_name: config.service_name.clone(),
            service_version: config.service_version.clone(),
            endpoint,
            protocol: config.otel_protocol.parse()?,
            export_timeout: Duration::from_millis(config.otel_timeout_ms),
            metric_interval: Duration::from_millis(config.metric_interval_ms),
            flush_timeout: config.flush_timeout(),
        })
    }

    /// Settings with export disabled, for tests and local runs.
    pub fn local(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            endpoint: None,
            protocol: ExportProtocol::Grpc,
            export_timeout: Duration::from_secs(10),
            metric_interval: Duration::from_secs(10),
            flush_timeout: Duration::from_secs(5),
        }
    }

    fn resource(&self) -> Resource {
        Resource::default().merge(&Resource::new([
            KeyValue::new("service.name", self.service_name.clone()),
            KeyValue::new("service.version", self.service_version.clone()),
        ]))
    }
}

/// Check that an endpoint is an absolute http(s) URI with a host.
///
/// Returns the endpoint without a trailing slash.
fn validate_endpoint(endpoint: &str) -> Result<String, TelemetryError> {
    let uri: Uri = endpoint.parse().map_err(|e| {
        TelemetryError::Configuration(format!("malformed OTLP endpoint {endpoint:?}: {e}"))
    })?;

    match uri.scheme_str() {
        Some("http" | "https") => {}
        _ => {
            return Err(TelemetryError::Configuration(format!(
                "OTLP endpoint {endpoint:?} must use http or https"
            )))
        }
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(TelemetryError::Configuration(format!(
            "OTLP endpoint {endpoint:?} has no host"
        )));
    }

    Ok(endpoint.trim_end_matches('/').to_string())
}

/// Process telemetry context.
///
/// Holds the trace, metric and log providers plus everything request
/// handlers need to instrument themselves. Constructed once at startup and
/// shared read-only (behind an `Arc`) until [`Telemetry::shutdown`].
pub struct Telemetry {
    service_name: String,
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
    logger_provider: LoggerProvider,
    log_bridge: Mutex<Option<LogBridge>>,
    tracer: Tracer,
    propagator: TraceContextPropagator,
    metrics: DiceMetrics,
    flush_timeout: Duration,
    shut_down: AtomicBool,
}

impl Telemetry {
    /// Build the telemetry pipeline.
    ///
    /// Must be called from within a Tokio runtime when an endpoint is
    /// configured, since the batch exporters run on it.
    pub fn init(config: &TelemetryConfig) -> Result<Self, TelemetryError> {
        let resource = config.resource();

        let telemetry = match config.endpoint.as_deref() {
            Some(endpoint) => {
                let tracer_provider = otlp_tracer_provider(config, endpoint, resource.clone())?;
                let meter_provider = otlp_meter_provider(config, endpoint, resource.clone())?;
                let logger_provider = otlp_logger_provider(config, endpoint, resource)?;
                tracing::info!(
                    service = %config.service_name,
                    endpoint,
                    protocol = ?config.protocol,
                    "OTLP trace, metric and log exporters configured"
                );
                Self::from_providers(config, tracer_provider, meter_provider, logger_provider)
            }
            None => {
                tracing::info!(
                    service = %config.service_name,
                    "No OTLP endpoint configured, telemetry will not be exported"
                );
                let tracer_provider = TracerProvider::builder()
                    .with_config(sdktrace::Config::default().with_resource(resource.clone()))
                    .build();
                Self::from_providers(
                    config,
                    tracer_provider,
                    manual_meter_provider(resource.clone()),
                    local_logger_provider(resource),
                )
            }
        };

        Ok(telemetry)
    }

    /// Build a context whose spans and log records go synchronously to the
    /// given exporters.
    ///
    /// Metrics are recorded against a manual reader and never exported.
    pub fn with_exporters<S, L>(config: &TelemetryConfig, span_exporter: S, log_exporter: L) -> Self
    where
        S: SpanExporter + 'static,
        L: LogExporter + 'static,
    {
        let resource = config.resource();
        let tracer_provider = TracerProvider::builder()
            .with_config(sdktrace::Config::default().with_resource(resource.clone()))
            .with_simple_exporter(span_exporter)
            .build();
        let logger_provider = LoggerProvider::builder()
            .with_resource(resource.clone())
            .with_simple_exporter(log_exporter)
            .build();
        Self::from_providers(
            config,
            tracer_provider,
            manual_meter_provider(resource),
            logger_provider,
        )
    }

    fn from_providers(
        config: &TelemetryConfig,
        tracer_provider: TracerProvider,
        meter_provider: SdkMeterProvider,
        logger_provider: LoggerProvider,
    ) -> Self {
        let tracer = tracer_provider.tracer(SCOPE_NAME);
        let metrics = DiceMetrics::new(&meter_provider.meter(SCOPE_NAME));

        Self {
            service_name: config.service_name.clone(),
            tracer_provider,
            meter_provider,
            logger_provider,
            log_bridge: Mutex::new(None),
            tracer,
            propagator: TraceContextPropagator::new(),
            metrics,
            flush_timeout: config.flush_timeout,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Tracer for spans created by this service.
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn metrics(&self) -> &DiceMetrics {
        &self.metrics
    }

    /// Extract a remote parent context from W3C trace-context headers.
    ///
    /// Returns an empty context when the headers carry none.
    pub fn extract_context(&self, headers: &HeaderMap) -> Context {
        self.propagator.extract(&HeaderExtractor(headers))
    }

    /// Forward log events from `bridge` to this context's logger provider.
    ///
    /// The bridge is detached again by [`Telemetry::shutdown`], before the
    /// providers are flushed.
    pub fn attach_logs(&self, bridge: LogBridge) {
        bridge.attach(&self.logger_provider);
        let mut slot = self.log_bridge.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(bridge);
    }

    /// Whether [`Telemetry::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Flush and shut down all providers.
    ///
    /// Only the first call does any work; later calls return `Ok(())`.
    /// Every provider is shut down even if another fails, and the whole
    /// flush is bounded by the configured flush timeout.
    pub async fn shutdown(&self) -> Result<(), TelemetryError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::info!(service = %self.service_name, "Flushing telemetry");
        let bridge = self
            .log_bridge
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(bridge) = bridge {
            bridge.detach();
        }

        let tracer_provider = self.tracer_provider.clone();
        let meter_provider = self.meter_provider.clone();
        let logger_provider = self.logger_provider.clone();

        // SDK shutdown blocks on the exporters, keep it off the async workers.
        let flush = tokio::task::spawn_blocking(move || {
            let mut failures = Vec::new();
            if let Err(e) = tracer_provider.shutdown() {
                failures.push(format!("traces: {e}"));
            }
            if let Err(e) = meter_provider.shutdown() {
                failures.push(format!("metrics: {e}"));
            }
            if let Err(e) = logger_provider.shutdown() {
                failures.push(format!("logs: {e}"));
            }
            failures
        });

        match tokio::time::timeout(self.flush_timeout, flush).await {
            Ok(Ok(failures)) if failures.is_empty() => {
                tracing::info!("Telemetry shut down");
                Ok(())
            }
            Ok(Ok(failures)) => Err(TelemetryError::Flush(failures.join("; "))),
            Ok(Err(e)) => Err(TelemetryError::Flush(format!("flush task failed: {e}"))),
            Err(_) => Err(TelemetryError::FlushTimeout(self.flush_timeout)),
        }
    }
}

fn otlp_tracer_provider(
    config: &TelemetryConfig,
    endpoint: &str,
    resource: Resource,
) -> Result<TracerProvider, TelemetryError> {
    let trace_config = sdktrace::Config::default().with_resource(resource);

    let provider = match config.protocol {
        ExportProtocol::Grpc => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc)
                .with_timeout(config.export_timeout);
            opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(trace_config)
                .install_batch(runtime::Tokio)?
        }
        ExportProtocol::HttpProtobuf => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(format!("{endpoint}/v1/traces"))
                .with_protocol(Protocol::HttpBinary)
                .with_timeout(config.export_timeout);
            opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(exporter)
                .with_trace_config(trace_config)
                .install_batch(runtime::Tokio)?
        }
    };

    Ok(provider)
}

fn otlp_meter_provider(
    config: &TelemetryConfig,
    endpoint: &str,
    resource: Resource,
) -> Result<SdkMeterProvider, TelemetryError> {
    let provider = match config.protocol {
        ExportProtocol::Grpc => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc)
                .with_timeout(config.export_timeout);
            opentelemetry_otlp::new_pipeline()
                .metrics(runtime::Tokio)
                .with_exporter(exporter)
                .with_resource(resource)
                .with_period(config.metric_interval)
                .build()?
        }
        ExportProtocol::HttpProtobuf => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(format!("{endpoint}/v1/metrics"))
                .with_protocol(Protocol::HttpBinary)
                .with_timeout(config.export_timeout);
            opentelemetry_otlp::new_pipeline()
                .metrics(runtime::Tokio)
                .with_exporter(exporter)
                .with_resource(resource)
                .with_period(config.metric_interval)
                .build()?
        }
    };

    Ok(provider)
}

fn otlp_logger_provider(
    config: &TelemetryConfig,
    endpoint: &str,
    resource: Resource,
) -> Result<LoggerProvider, TelemetryError> {
    let provider = match config.protocol {
        ExportProtocol::Grpc => {
            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::Grpc)
                .with_timeout(config.export_timeout);
            opentelemetry_otlp::new_pipeline()
                .logging()
                .with_exporter(exporter)
                .with_resource(resource)
                .install_batch(runtime::Tokio)?
        }
        ExportProtocol::HttpProtobuf => {
            let exporter = opentelemetry_otlp::new_exporter()
                .http()
                .with_endpoint(format!("{endpoint}/v1/logs"))
                .with_protocol(Protocol::HttpBinary)
                .with_timeout(config.export_timeout);
            opentelemetry_otlp::new_pipeline()
                .logging()
                .with_exporter(exporter)
                .with_resource(resource)
                .install_batch(runtime::Tokio)?
        }
    };

    Ok(provider)
}

/// Logger provider whose records are dropped.
fn local_logger_provider(resource: Resource) -> LoggerProvider {
    LoggerProvider::builder().with_resource(resource).build()
}

/// Meter provider whose metrics are recorded but not exported.
fn manual_meter_provider(resource: Resource) -> SdkMeterProvider {
    SdkMeterProvider::builder()
        .with_reader(ManualReader::builder().build())
        .with_resource(resource)
        .build()
}

/// Reads propagation headers from an HTTP header map.
struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|k| k.as_str()).collect()
    }
}
