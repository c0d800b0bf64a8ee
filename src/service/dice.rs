//! Dice roll handler.
//!
//! Rolls a six-sided die per request, recording a `roll` span, a
//! `dice.rolls` counter increment and a log line for each roll.

use axum::extract::State;
use axum::Extension;
use opentelemetry::trace::{Span as _, Tracer as _};
use opentelemetry::{Context, KeyValue};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};

use super::AppState;

/// Random source for dice rolls.
///
/// Production instances are seeded from OS entropy; tests use
/// [`Dice::seeded`] for reproducible sequences.
pub struct Dice {
    rng: Mutex<StdRng>,
}

impl Dice {
    /// Create a die seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Create a die with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Roll once, returning a value in `1..=6`.
    pub fn roll(&self) -> u8 {
        // A poisoned lock still holds a usable generator.
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        rng.gen_range(1..=6)
    }
}

/// Handle a request to `/rolldice`.
///
/// The request context is placed in the request extensions by the tracing
/// middleware; without it the `roll` span becomes a root span.
pub async fn handle_roll(
    State(state): State<AppState>,
    parent: Option<Extension<Context>>,
) -> String {
    let parent = parent.map_or_else(Context::new, |Extension(cx)| cx);
    let mut span = state.telemetry.tracer().start_with_context("roll", &parent);

    let roll = state.dice.roll();
    let trace_id = span.span_context().trace_id();
    tracing::info!(result = roll, %trace_id, "Anonymous player is rolling the dice");

    span.set_attribute(KeyValue::new("roll.value", i64::from(roll)));
    state.telemetry.metrics().record_roll(roll);
    span.end();

    roll.to_string()
}
