//! Interrupt handling and shutdown sequencing.
//!
//! The interrupt handler cancels a shared token; the sequencer waits for the
//! HTTP server to drain and then always flushes telemetry, reporting failures
//! from both together.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::observability::{Telemetry, TelemetryError};
use crate::server::{HttpServer, ServerError};

/// Exit code used when a second interrupt arrives during shutdown.
const SECOND_INTERRUPT_EXIT_CODE: i32 = 130;

/// Failures collected while shutting down.
///
/// At least one field is set whenever this error is returned.
#[derive(Debug, Error)]
#[error("{}", describe(.server, .telemetry))]
pub struct ShutdownError {
    pub server: Option<ServerError>,
    pub telemetry: Option<TelemetryError>,
}

fn describe(server: &Option<ServerError>, telemetry: &Option<TelemetryError>) -> String {
    let mut parts = Vec::with_capacity(2);
    if let Some(e) = server {
        parts.push(format!("http server: {e}"));
    }
    if let Some(e) = telemetry {
        parts.push(format!("telemetry: {e}"));
    }
    format!("shutdown failed: {}", parts.join("; "))
}

/// Wait for SIGINT (Ctrl+C) and cancel `token`.
///
/// A second SIGINT while shutdown is in progress exits the process
/// immediately rather than starting another shutdown.
pub async fn wait_for_interrupt(token: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for interrupt signal");
        return;
    }
    tracing::info!("Received SIGINT (Ctrl+C), initiating shutdown...");
    token.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Received second SIGINT, exiting immediately");
        std::process::exit(SECOND_INTERRUPT_EXIT_CODE);
    }
}

/// Stop the HTTP server, then shut down telemetry.
///
/// Returns when `server` has stopped (after `token` is cancelled, or on its
/// own if the accept task failed). Telemetry is flushed afterwards even if
/// the server failed to drain in time.
pub async fn shutdown(
    token: CancellationToken,
    server: HttpServer,
    telemetry: &Telemetry,
) -> Result<(), ShutdownError> {
    let server_result = server.wait().await;
    // Covers the case where the server stopped without a signal.
    token.cancel();

    let telemetry_result = telemetry.shutdown().await;
    if let Err(e) = &telemetry_result {
        tracing::warn!(error = %e, "Telemetry shutdown failed");
    }

    match (server_result.err(), telemetry_result.err()) {
        (None, None) => Ok(()),
        (server, telemetry) => Err(ShutdownError { server, telemetry }),
    }
}
