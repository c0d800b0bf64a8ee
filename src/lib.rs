//! Dice: a dice-rolling HTTP service instrumented with OpenTelemetry.
//!
//! Serves a single route, `/rolldice`, that returns a random integer in
//! `1..=6`. Every request is wrapped in a server span carrying the matched
//! route; each roll is recorded as a child span, a counter increment and a
//! log line.
//!
//! # Architecture
//!
//! - **Explicit telemetry context**: trace, metric and log providers live in a
//!   [`observability::Telemetry`] value handed to the router, not in globals
//! - **Cooperative shutdown**: a cancellation token stops the accept loop,
//!   in-flight requests drain within a bound, then telemetry is flushed
//!
//! # Modules
//!
//! - [`config`]: CLI and environment configuration
//! - [`observability`]: Logging, telemetry pipeline and metric instruments
//! - [`server`]: HTTP server lifecycle
//! - [`service`]: Router, dice handler and tracing middleware
//! - [`shutdown`]: Interrupt handling and shutdown sequencing

// Lint configuration
#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions, // server::ServerError is fine
    clippy::must_use_candidate,      // Not all functions need #[must_use]
    clippy::missing_errors_doc,      // Error docs can be verbose
    clippy::missing_panics_doc       // Panic docs can be verbose
)]

pub mod config;
pub mod observability;
pub mod server;
pub mod service;
pub mod shutdown;
