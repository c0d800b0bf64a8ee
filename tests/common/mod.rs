//! Test utilities and server harness for dice tests.
//!
//! Provides:
//! - In-process test server with in-memory span capture
//! - A minimal HTTP/1.1 client over raw TCP
//! - Span attribute helpers

#![allow(dead_code)]

use axum::Router;
use dice::observability::tracing::init_test_tracing;
use dice::observability::{Telemetry, TelemetryConfig};
use dice::server::{HttpServer, ServerSettings};
use dice::service::{self, AppState, Dice};
use dice::shutdown::{self, ShutdownError};
use opentelemetry::Value;
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::testing::logs::InMemoryLogsExporter;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Seed used for test dice so failures are reproducible.
pub const TEST_SEED: u64 = 0x5eed;

/// Build a telemetry context whose spans are captured in memory.
pub fn test_telemetry() -> (Arc<Telemetry>, InMemorySpanExporter) {
    let exporter = InMemorySpanExporter::default();
    let telemetry = Telemetry::with_exporters(
        &TelemetryConfig::local("dice-test"),
        exporter.clone(),
        InMemoryLogsExporter::default(),
    );
    (Arc::new(telemetry), exporter)
}

/// Build the dice router backed by `telemetry` and a seeded die.
pub fn test_router(telemetry: Arc<Telemetry>) -> Router {
    let state = AppState::new(telemetry, Dice::seeded(TEST_SEED));
    service::router(state, Duration::from_secs(5))
}

/// An in-process dice server listening on a random loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub token: CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub spans: InMemorySpanExporter,
    server: HttpServer,
}

impl TestServer {
    /// Start the dice service.
    pub async fn start() -> Self {
        let (telemetry, spans) = test_telemetry();
        let app = test_router(Arc::clone(&telemetry));
        Self::start_with(app, telemetry, spans, Duration::from_secs(2)).await
    }

    /// Start a server for an arbitrary router.
    pub async fn start_with(
        app: Router,
        telemetry: Arc<Telemetry>,
        spans: InMemorySpanExporter,
        drain_timeout: Duration,
    ) -> Self {
        init_test_tracing();
        let token = CancellationToken::new();
        let settings = ServerSettings::new("127.0.0.1:0").with_drain_timeout(drain_timeout);
        let server = HttpServer::start(&settings, app, token.clone())
            .await
            .expect("failed to start test server");
        Self {
            addr: server.local_addr(),
            token,
            telemetry,
            spans,
            server,
        }
    }

    /// Cancel the token and run the full shutdown sequence.
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        self.token.cancel();
        shutdown::shutdown(self.token, self.server, &self.telemetry).await
    }

    /// Spans exported so far.
    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.spans.get_finished_spans().expect("failed to read spans")
    }
}

/// Format a body-less HTTP/1.1 request that closes the connection afterwards.
pub fn request_bytes(addr: SocketAddr, method: &str, path: &str) -> String {
    format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
}

/// Write `request` and read until the server closes the connection.
///
/// A reset counts as a close; whatever arrived before it is returned.
pub async fn exchange(addr: SocketAddr, request: &str) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("failed to connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("failed to send request");

    let mut raw = Vec::new();
    let _ = stream.read_to_end(&mut raw).await;
    raw
}

/// Send one HTTP/1.1 request and return status code and body.
pub async fn http_request(addr: SocketAddr, method: &str, path: &str) -> (u16, String) {
    let raw = exchange(addr, &request_bytes(addr, method, path)).await;
    let raw = String::from_utf8(raw).expect("response is not UTF-8");

    let (head, body) = raw
        .split_once("\r\n\r\n")
        .expect("response has no header terminator");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("malformed status line");
    (status, body.to_string())
}

/// `GET` shorthand for [`http_request`].
pub async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    http_request(addr, "GET", path).await
}

/// Look up an attribute on a finished span.
pub fn attribute(span: &SpanData, key: &str) -> Option<Value> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

/// Look up an attribute on a finished span, rendered as a string.
pub fn attribute_string(span: &SpanData, key: &str) -> Option<String> {
    attribute(span, key).map(|value| value.as_str().into_owned())
}

/// Find the first finished span with the given name.
pub fn span_named<'a>(spans: &'a [SpanData], name: &str) -> Option<&'a SpanData> {
    spans.iter().find(|span| span.name == name)
}
