//! HTTP service for the dice roller.
//!
//! Builds the axum router: the `/rolldice` route, a per-request timeout,
//! and the tracing middleware wrapping everything.

pub mod dice;
pub mod trace;

pub use dice::Dice;

use axum::http::StatusCode;
use axum::routing::any;
use axum::{middleware, Router};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use crate::observability::Telemetry;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub telemetry: Arc<Telemetry>,
    pub dice: Arc<Dice>,
}

impl AppState {
    pub fn new(telemetry: Arc<Telemetry>, dice: Dice) -> Self {
        Self {
            telemetry,
            dice: Arc::new(dice),
        }
    }
}

/// Build the HTTP router.
///
/// `/rolldice` accepts any method. Requests that outlive `request_timeout`
/// get `408 Request Timeout`.
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/rolldice", any(dice::handle_roll))
        .fallback(handle_not_found)
        .layer(timeout_layer(request_timeout))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            trace::trace_request,
        ))
        .with_state(state)
}

fn timeout_layer(request_timeout: Duration) -> TimeoutLayer {
    TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout)
}

async fn handle_not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}
