//! Evaluator: trains a forest configured from a global spec on a seeded split
//! and scores it on the held-out rows.

mod dataset;
mod forest;
mod metrics;

pub use dataset::LabeledDataset;
pub use forest::{resolve_max_features, ForestParams, RandomForest};
pub use metrics::{ConfusionMatrix, EvaluationMetrics};

use std::time::Instant;

use tracing::{info, warn};

use crate::config::EvaluationConfig;
use crate::error::EvaluationFailure;
use crate::package::GlobalModelSpec;

#[derive(Debug, Clone)]
pub struct Evaluator {
    test_fraction: f64,
    seed: u64,
    min_samples_split: usize,
    max_estimators: u32,
}

impl Default for Evaluator {
    fn default() -> Self { Self::from_config(&EvaluationConfig::default()) }
}

impl Evaluator {
    pub fn from_config(cfg: &EvaluationConfig) -> Self {
        Self {
            test_fraction: cfg.test_fraction,
            seed: cfg.seed,
            min_samples_split: cfg.min_samples_split,
            max_estimators: cfg.max_estimators,
        }
    }

    /// Synchronous and CPU-bound; async callers should run it on a blocking thread.
    pub fn evaluate(&self, spec: &GlobalModelSpec, data: &LabeledDataset) -> Result<EvaluationMetrics, EvaluationFailure> {
        let started = Instant::now();
        if spec.n_estimators > self.max_estimators {
            return Err(EvaluationFailure::InvalidHyperparameter(format!(
                "n_estimators {} exceeds the configured limit of {}",
                spec.n_estimators, self.max_estimators
            )));
        }
        if !spec.feature_importances.is_empty() && spec.feature_importances.len() != data.n_features() {
            warn!(
                spec_features = spec.feature_importances.len(),
                dataset_features = data.n_features(),
                "feature importance length differs from dataset feature count"
            );
        }
        let (train, test) = data.split(self.test_fraction, self.seed)?;
        let params = ForestParams {
            n_estimators: spec.n_estimators,
            max_features: spec.max_features.clone(),
            max_depth: spec.max_depth,
            min_samples_split: self.min_samples_split,
            seed: self.seed,
        };
        let forest = RandomForest::fit(&train.rows, &train.labels, &params)?;
        let predicted = forest.predict(&test.rows)?;
        let metrics = EvaluationMetrics::from(ConfusionMatrix::tally(&test.labels, &predicted));
        info!(
            train = train.len(),
            test = test.len(),
            accuracy = metrics.accuracy,
            f1 = metrics.f1,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "global model evaluated"
        );
        Ok(metrics)
    }
}
