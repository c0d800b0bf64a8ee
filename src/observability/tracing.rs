//! Structured logging setup.
//!
//! Configures the process-wide `tracing` subscriber with:
//! - Environment-based filter (via RUST_LOG)
//! - Human-readable or JSON line output
//! - A slot for the OpenTelemetry log bridge, filled once telemetry is up

use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_sdk::logs::{Logger, LoggerProvider};
use tracing::Level;
use tracing_subscriber::filter::{Filtered, Targets};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::LogFormat;

type OtelLogLayer = OpenTelemetryTracingBridge<LoggerProvider, Logger>;
type LogBridgeLayer = Filtered<reload::Layer<Option<OtelLogLayer>, Registry>, Targets, Registry>;

/// Handle to the log bridge slot of the installed subscriber.
///
/// Events logged by this crate at `INFO` and above are forwarded to the
/// attached logger provider. Exporter internals (hyper, tonic, reqwest) are
/// never forwarded, so exporting a log cannot produce another one.
#[derive(Clone)]
pub struct LogBridge {
    handle: reload::Handle<Option<OtelLogLayer>, Registry>,
}

impl LogBridge {
    /// Start forwarding log events to `provider`.
    pub fn attach(&self, provider: &LoggerProvider) {
        let layer = OpenTelemetryTracingBridge::new(provider);
        if let Err(e) = self.handle.reload(Some(layer)) {
            tracing::warn!(error = %e, "Failed to attach OpenTelemetry log bridge");
        }
    }

    /// Stop forwarding log events.
    pub fn detach(&self) {
        // Fails only if the subscriber is gone, in which case nothing is forwarded anyway.
        let _ = self.handle.reload(None);
    }
}

pub(crate) fn log_bridge_layer() -> (LogBridgeLayer, LogBridge) {
    let (layer, handle) = reload::Layer::new(None);
    let layer = layer.with_filter(Targets::new().with_target("dice", Level::INFO));
    (layer, LogBridge { handle })
}

/// Initialize logging for the given service.
///
/// `RUST_LOG` takes precedence; otherwise `log_level` is used as the default
/// directive, with debug output enabled for this crate. The returned
/// [`LogBridge`] starts detached.
///
/// # Panics
///
/// Panics if a global subscriber has already been installed.
pub fn init_tracing(service_name: &str, log_level: &str, format: LogFormat) -> LogBridge {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},dice=debug")));

    let (log_layer, bridge) = log_bridge_layer();
    let registry = tracing_subscriber::registry().with(log_layer).with(filter);

    match format {
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            registry.with(fmt_layer).init();
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_thread_ids(true);
            registry.with(fmt_layer).init();
        }
    }

    tracing::info!(service = service_name, "Logging initialized");
    bridge
}

/// Initialize logging for tests (only logs errors).
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("error")
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_sdk::testing::logs::InMemoryLogsExporter;

    #[test]
    fn test_log_bridge_forwards_only_while_attached() {
        let exporter = InMemoryLogsExporter::default();
        let provider = LoggerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();

        let (layer, bridge) = log_bridge_layer();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("before attach");
            bridge.attach(&provider);
            tracing::info!(result = 4, "Anonymous player is rolling the dice");
            tracing::debug!("below the bridge level");
            tracing::info!(target: "hyper::proto::h1", "exporter internals");
            bridge.detach();
            tracing::info!("after detach");
        });

        let logs = exporter.get_emitted_logs().unwrap();
        assert_eq!(logs.len(), 1, "exactly one event should be forwarded");
        let body = format!("{:?}", logs[0].record.body);
        assert!(
            body.contains("Anonymous player is rolling the dice"),
            "unexpected log body: {body}"
        );
    }
}
