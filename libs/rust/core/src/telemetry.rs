//! Pipeline metric instruments on the global OpenTelemetry meter.
//!
//! No exporter is installed here. Until the embedding service registers a meter
//! provider these are no-ops.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::error::PipelineError;

#[derive(Clone, Debug)]
pub struct PipelineMetrics {
    pub runs_total: Counter<u64>,
    pub stage_failures_total: Counter<u64>,
    pub fetch_latency_ms: Histogram<f64>,
    pub participants_aggregated_total: Counter<u64>,
}

static PIPELINE_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedagg_pipeline"));

pub static PIPELINE_METRICS: Lazy<PipelineMetrics> = Lazy::new(|| PipelineMetrics {
    runs_total: PIPELINE_METER
        .u64_counter("fedagg_runs_total")
        .with_description("Aggregation runs by outcome")
        .build(),
    stage_failures_total: PIPELINE_METER
        .u64_counter("fedagg_stage_failures_total")
        .with_description("Failures by pipeline stage and error kind")
        .build(),
    fetch_latency_ms: PIPELINE_METER
        .f64_histogram("fedagg_fetch_latency_ms")
        .with_description("Gateway fetch latency per participant, retries included (ms)")
        .with_unit("ms")
        .build(),
    participants_aggregated_total: PIPELINE_METER
        .u64_counter("fedagg_participants_aggregated_total")
        .with_description("Participant packages folded into a global spec")
        .build(),
});

impl PipelineMetrics {
    pub fn record_failure(&self, err: &PipelineError) {
        self.stage_failures_total.add(1, &[KeyValue::new("stage", err.stage().as_str()), KeyValue::new("kind", err.kind())]);
    }

    pub fn record_outcome(&self, outcome: &'static str) {
        self.runs_total.add(1, &[KeyValue::new("outcome", outcome)]);
    }
}
