//! HTTP server setup and lifecycle.
//!
//! Runs an HTTP/1.1 accept loop on a background task with:
//! - Cancellation-token driven graceful shutdown
//! - Every connection tracked, so the drain window can force-close them
//! - A header read timeout per connection
//! - Lifecycle state published on a watch channel

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::observability::tracing::LogBridge;
use crate::observability::{Telemetry, TelemetryConfig};
use crate::service::{self, AppState, Dice};
use crate::shutdown;

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Error type for HTTP server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP server did not drain within {0:?}")]
    DrainTimeout(Duration),

    #[error("HTTP server task failed: {0}")]
    Task(#[from] JoinError),
}

/// Server lifecycle state.
///
/// `Stopped → Starting → Listening → Draining → Stopped`. A failed bind goes
/// straight back to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Starting,
    Listening,
    Draining,
}

/// Create a lifecycle channel in the `Stopped` state.
///
/// Subscribe before handing the sender to [`HttpServer::start_with_lifecycle`]
/// to observe every transition, including `Starting`.
pub fn lifecycle_channel() -> (watch::Sender<Lifecycle>, watch::Receiver<Lifecycle>) {
    watch::channel(Lifecycle::Stopped)
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: String,
    /// Time a client has to send the request headers.
    pub read_timeout: Duration,
    /// Time in-flight requests get to finish after shutdown begins.
    pub drain_timeout: Duration,
}

impl ServerSettings {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            read_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            addr: config.listen_addr(),
            read_timeout: config.read_timeout(),
            drain_timeout: config.drain_timeout(),
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

/// A running HTTP server.
pub struct HttpServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    drain_timeout: Duration,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

impl HttpServer {
    /// Bind `settings.addr` and start serving `app` on a background task.
    ///
    /// The server stops accepting connections once `shutdown` is cancelled;
    /// [`HttpServer::wait`] then gives in-flight requests the drain timeout
    /// to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound, e.g.
    /// because it is already in use.
    pub async fn start(
        settings: &ServerSettings,
        app: Router,
        shutdown: CancellationToken,
    ) -> Result<Self, ServerError> {
        let (lifecycle, _) = lifecycle_channel();
        Self::start_with_lifecycle(settings, app, shutdown, lifecycle).await
    }

    /// Like [`HttpServer::start`], publishing transitions on `lifecycle`.
    pub async fn start_with_lifecycle(
        settings: &ServerSettings,
        app: Router,
        shutdown: CancellationToken,
        lifecycle: watch::Sender<Lifecycle>,
    ) -> Result<Self, ServerError> {
        let lifecycle = Arc::new(lifecycle);
        lifecycle.send_replace(Lifecycle::Starting);

        let bind_error = |source: std::io::Error| ServerError::Bind {
            addr: settings.addr.clone(),
            source,
        };
        let listener = match TcpListener::bind(&settings.addr).await {
            Ok(listener) => listener,
            Err(source) => {
                lifecycle.send_replace(Lifecycle::Stopped);
                return Err(bind_error(source));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                lifecycle.send_replace(Lifecycle::Stopped);
                return Err(bind_error(source));
            }
        };

        lifecycle.send_replace(Lifecycle::Listening);
        tracing::info!(address = %local_addr, "Starting dice HTTP server");

        let force_close = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(
            listener,
            app,
            settings.read_timeout,
            shutdown.clone(),
            force_close.clone(),
            Arc::clone(&lifecycle),
        ));

        Ok(Self {
            local_addr,
            handle,
            shutdown,
            force_close,
            drain_timeout: settings.drain_timeout,
            lifecycle,
        })
    }

    /// Address the server is actually listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Wait for the server to stop.
    ///
    /// Returns once the shutdown token has been cancelled and in-flight
    /// requests have drained. If draining takes longer than the drain window,
    /// every open connection is aborted and [`ServerError::DrainTimeout`] is
    /// returned; either way no connection is still being served when this
    /// returns.
    pub async fn wait(self) -> Result<(), ServerError> {
        let Self {
            mut handle,
            shutdown,
            force_close,
            drain_timeout,
            lifecycle,
            ..
        } = self;

        let finished_early = tokio::select! {
            joined = &mut handle => Some(joined),
            () = shutdown.cancelled() => None,
        };

        let result = match finished_early {
            Some(joined) => joined.map_err(ServerError::from),
            None => match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(joined) => joined.map_err(ServerError::from),
                Err(_) => {
                    force_close.cancel();
                    if let Err(e) = handle.await {
                        tracing::warn!(error = %e, "HTTP server task failed while closing connections");
                    }
                    Err(ServerError::DrainTimeout(drain_timeout))
                }
            },
        };

        lifecycle.send_replace(Lifecycle::Stopped);
        match &result {
            Ok(()) => tracing::info!("HTTP server stopped"),
            Err(e) => tracing::warn!(error = %e, "HTTP server stopped with error"),
        }
        result
    }
}

/// Accept connections until `shutdown`, then drain them.
///
/// Draining ends when every connection has finished, or when `force_close`
/// fires, in which case the remaining connections are aborted.
async fn accept_loop(
    listener: TcpListener,
    app: Router,
    read_timeout: Duration,
    shutdown: CancellationToken,
    force_close: CancellationToken,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        app.clone(),
                        read_timeout,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }

    drop(listener);
    lifecycle.send_replace(Lifecycle::Draining);
    tracing::info!(
        connections = connections.len(),
        "Shutdown signal received, draining HTTP server"
    );

    let drained = tokio::select! {
        () = drain(&mut connections) => true,
        () = force_close.cancelled() => false,
    };
    if !drained {
        tracing::warn!(
            connections = connections.len(),
            "Drain window expired, closing open connections"
        );
        connections.shutdown().await;
    }
}

async fn drain(connections: &mut JoinSet<()>) {
    while connections.join_next().await.is_some() {}
}

/// Serve one HTTP/1.1 connection.
///
/// Once `shutdown` fires, the in-flight request (if any) completes and the
/// connection is closed; idle keep-alive connections close immediately.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    app: Router,
    read_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut builder = http1::Builder::new();
    builder
        .timer(TokioTimer::new())
        .header_read_timeout(read_timeout);
    let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(app));
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "Connection closed with error");
    }
}

/// Run the dice service until `shutdown_token` is cancelled.
///
/// Initializes telemetry, attaches `log_bridge` to it when given, serves
/// HTTP, and on cancellation drains the server before flushing telemetry.
/// Startup failures abort immediately; shutdown failures from both
/// subsystems are reported together.
pub async fn run_server(
    config: Config,
    log_bridge: Option<LogBridge>,
    shutdown_token: CancellationToken,
) -> anyhow::Result<()> {
    let telemetry_config = TelemetryConfig::from_config(&config)?;
    let telemetry = Arc::new(Telemetry::init(&telemetry_config)?);
    if let Some(bridge) = log_bridge {
        telemetry.attach_logs(bridge);
    }

    let state = AppState::new(Arc::clone(&telemetry), Dice::from_entropy());
    let app = service::router(state, config.request_timeout());

    let settings = ServerSettings::from_config(&config);
    let server = match HttpServer::start(&settings, app, shutdown_token.clone()).await {
        Ok(server) => server,
        Err(e) => {
            // Nothing was served, but exporters may hold connections.
            if let Err(flush_err) = telemetry.shutdown().await {
                tracing::warn!(error = %flush_err, "Failed to shut down telemetry after bind failure");
            }
            return Err(e.into());
        }
    };

    shutdown::shutdown(shutdown_token, server, &telemetry).await?;
    Ok(())
}
