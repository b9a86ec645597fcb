//! Secure federated aggregation of tree-ensemble parameter packages.
//!
//! A run locates each participant's encrypted package, fetches it from a
//! content-addressed gateway, authenticates and decodes it, combines all
//! packages into a [`GlobalModelSpec`] and scores that spec on a labeled
//! dataset. See [`FederationPipeline::run`].

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::prelude::*;

pub mod aggregator;
pub mod config;
pub mod crypto;
pub mod error;
pub mod evaluator;
pub mod locator;
pub mod package;
pub mod pipeline;
pub mod retriever;
pub mod telemetry;

pub use aggregator::{combine, validate_shapes};
pub use config::{load_config, PipelineConfig};
pub use crypto::SymmetricKey;
pub use error::{PipelineError, Stage};
pub use evaluator::{EvaluationMetrics, Evaluator, LabeledDataset};
pub use locator::{HttpRegistry, ParameterLocator, StaticRegistry};
pub use package::{ContentHash, GlobalModelSpec, KeyMaterial, MaxDepth, MaxFeatures, ModelParameterPackage, ParticipantPackage, ParticipantReference};
pub use pipeline::{ExcludedParticipant, FederationPipeline, RunContext, RunFailure, RunReport, RunState};
pub use retriever::{BlobSource, HttpGateway, SecureRetriever};
pub use telemetry::PIPELINE_METRICS;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global fmt subscriber once. `RUST_LOG` filters (default `info`);
/// `FEDAGG_JSON_LOG=1|true` switches to JSON lines.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FEDAGG_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let fmt_layer = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .with_writer(std::io::stderr)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .with_writer(std::io::stderr)
                .boxed()
        };
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "fedagg", service, "tracing initialized");
    Ok(())
}
