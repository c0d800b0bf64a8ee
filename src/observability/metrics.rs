//! OpenTelemetry metric instruments for the dice service.
//!
//! Key metrics:
//! - dice.rolls: Counter of rolls, partitioned by `roll.value`

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

/// Instrumentation scope name for meters and tracers created by this crate.
pub const SCOPE_NAME: &str = "dice";

/// Dice metrics registry.
#[derive(Debug, Clone)]
pub struct DiceMetrics {
    /// Number of rolls by roll value.
    pub rolls: Counter<u64>,
}

impl DiceMetrics {
    /// Create the instruments from a meter.
    pub fn new(meter: &Meter) -> Self {
        Self {
            rolls: meter
                .u64_counter("dice.rolls")
                .with_description("The number of rolls by roll value")
                .with_unit("{roll}")
                .init(),
        }
    }

    /// Record one roll of the dice.
    pub fn record_roll(&self, value: u8) {
        self.rolls
            .add(1, &[KeyValue::new("roll.value", i64::from(value))]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry::Value;
    use opentelemetry_sdk::metrics::data::{ResourceMetrics, Sum};
    use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
    use opentelemetry_sdk::runtime;
    use opentelemetry_sdk::testing::metrics::InMemoryMetricsExporter;
    use std::collections::HashMap;

    /// Sum `dice.rolls` data points by their `roll.value` attribute.
    fn roll_counts(resource_metrics: &[ResourceMetrics]) -> HashMap<i64, u64> {
        let mut counts = HashMap::new();
        let rolls = resource_metrics
            .iter()
            .flat_map(|rm| &rm.scope_metrics)
            .flat_map(|scope| &scope.metrics)
            .filter(|metric| metric.name == "dice.rolls");

        for metric in rolls {
            let sum = metric
                .data
                .as_any()
                .downcast_ref::<Sum<u64>>()
                .expect("dice.rolls should be a u64 sum");
            assert!(sum.is_monotonic);
            for point in &sum.data_points {
                let value = point
                    .attributes
                    .iter()
                    .find(|kv| kv.key.as_str() == "roll.value")
                    .and_then(|kv| match kv.value {
                        Value::I64(v) => Some(v),
                        _ => None,
                    })
                    .expect("data point without roll.value");
                *counts.entry(value).or_insert(0) += point.value;
            }
        }
        counts
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_record_roll_counts_by_value() {
        let exporter = InMemoryMetricsExporter::default();
        let reader = PeriodicReader::builder(exporter.clone(), runtime::Tokio).build();
        let provider = SdkMeterProvider::builder().with_reader(reader).build();
        let metrics = DiceMetrics::new(&provider.meter(SCOPE_NAME));

        for value in [1, 6, 6, 3, 6] {
            metrics.record_roll(value);
        }
        provider.force_flush().unwrap();

        let finished = exporter.get_finished_metrics().unwrap();
        assert_eq!(
            roll_counts(&finished),
            HashMap::from([(1, 1), (3, 1), (6, 3)])
        );

        provider.shutdown().unwrap();
    }
}
