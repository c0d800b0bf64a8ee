//! Request tracing middleware.
//!
//! Wraps every request, matched or not, in a server span named after the
//! matched route pattern. The span context is stored in the request
//! extensions so handlers can create child spans.

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _};
use opentelemetry::KeyValue;
use tracing::Instrument;

use super::AppState;

/// Create a server span around the rest of the request pipeline.
///
/// Records `http.route` when a route matched, plus method, path and the
/// response status code. 5xx responses mark the span as failed. The span is
/// owned by the request context, so it also ends if the handler panics or
/// the request future is dropped.
pub async fn trace_request(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_owned();
    let path = request.uri().path().to_owned();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned());

    let span_name = match &route {
        Some(route) => format!("{method} {route}"),
        None => method.clone(),
    };

    let mut attributes = vec![
        KeyValue::new("http.request.method", method.clone()),
        KeyValue::new("url.path", path.clone()),
    ];
    if let Some(route) = &route {
        attributes.push(KeyValue::new("http.route", route.clone()));
    }

    let telemetry = &state.telemetry;
    let parent = telemetry.extract_context(request.headers());
    let span = telemetry
        .tracer()
        .span_builder(span_name)
        .with_kind(SpanKind::Server)
        .with_attributes(attributes)
        .start_with_context(telemetry.tracer(), &parent);
    let cx = parent.with_span(span);
    request.extensions_mut().insert(cx.clone());

    let log_span = tracing::debug_span!(
        "request",
        %method,
        %path,
        route = route.as_deref().unwrap_or("")
    );
    let response = next.run(request).instrument(log_span).await;

    let status = response.status();
    let span = cx.span();
    span.set_attribute(KeyValue::new(
        "http.response.status_code",
        i64::from(status.as_u16()),
    ));
    if status.is_server_error() {
        span.set_status(Status::error(format!("server error: {status}")));
    }
    span.end();

    tracing::debug!(%method, %path, status = status.as_u16(), "Request completed");
    response
}
