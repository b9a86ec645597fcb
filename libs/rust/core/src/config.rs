use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fedagg_resilience::RetryConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_blob_bytes: u64,
    pub retry_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gateway.pinata.cloud".into(),
            timeout_secs: 10,
            max_blob_bytes: 64 * 1024 * 1024,
            retry_attempts: 2,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 2_000,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration { Duration::from_secs(self.timeout_secs) }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            ..RetryConfig::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub max_concurrency: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self { Self { max_concurrency: 8 } }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// When set, participants failing retrieval are dropped as long as this many survive.
    pub quorum_min: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub target_column: String,
    pub test_fraction: f64,
    pub seed: u64,
    pub min_samples_split: usize,
    /// Upper bound on the aggregated `n_estimators` the evaluator will train.
    pub max_estimators: u32,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self { target_column: "Class".into(), test_fraction: 0.2, seed: 42, min_samples_split: 2, max_estimators: 1_000 }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    pub registry_file: Option<PathBuf>,
    pub registry_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gateway: GatewayConfig,
    pub retrieval: RetrievalConfig,
    pub aggregation: AggregationConfig,
    pub evaluation: EvaluationConfig,
    pub locator: LocatorConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.gateway.timeout_secs == 0 { bail!("gateway.timeout_secs must be positive"); }
        if self.gateway.max_blob_bytes == 0 { bail!("gateway.max_blob_bytes must be positive"); }
        if self.retrieval.max_concurrency == 0 { bail!("retrieval.max_concurrency must be positive"); }
        if self.aggregation.quorum_min == Some(0) { bail!("aggregation.quorum_min must be at least 1"); }
        let f = self.evaluation.test_fraction;
        if !(f > 0.0 && f < 1.0) { bail!("evaluation.test_fraction must lie strictly between 0 and 1, got {f}"); }
        if self.evaluation.min_samples_split < 2 { bail!("evaluation.min_samples_split must be at least 2"); }
        let max_est = self.evaluation.max_estimators;
        if max_est == 0 || max_est > u32::from(u16::MAX) {
            bail!("evaluation.max_estimators must lie in 1..={}, got {max_est}", u16::MAX);
        }
        if self.locator.registry_file.is_none() && self.locator.registry_url.is_none() {
            bail!("one of locator.registry_file or locator.registry_url is required");
        }
        Ok(())
    }
}

/// Defaults, then the file named by `FEDAGG_CONFIG_FILE`, then `FEDAGG__SECTION__KEY` variables.
pub fn load_config(service: &str) -> Result<PipelineConfig> {
    let mut builder = config::Config::builder();
    if let Ok(file) = std::env::var("FEDAGG_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("FEDAGG")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );
    let cfg: PipelineConfig = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .with_context(|| format!("loading configuration for {service}"))?;
    cfg.validate()?;
    tracing::debug!(service, ?cfg, "configuration loaded");
    Ok(cfg)
}
