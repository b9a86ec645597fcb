//! Combines federation packages into one global model spec.
//!
//! Numeric fields are averaged elementwise. `max_features` is categorical and
//! is taken from the first package in canonical order. Participants with an
//! unbounded `max_depth` do not take part in the depth mean.

use tracing::debug;

use crate::error::{AggregationFailure, PipelineError, ValidationFailure};
use crate::package::{GlobalModelSpec, MaxDepth, ParticipantPackage};

/// Checks that every package's vectors have the lengths of the first package.
pub fn validate_shapes(packages: &[ParticipantPackage]) -> Result<(), PipelineError> {
    let Some(first) = packages.first() else { return Err(AggregationFailure::EmptyInput.into()) };
    let expected_pred = first.package.predictions.len();
    let expected_imp = first.package.feature_importances.len();
    for p in &packages[1..] {
        let mismatch = if p.package.predictions.len() != expected_pred {
            Some(("predictions", expected_pred, p.package.predictions.len()))
        } else if p.package.feature_importances.len() != expected_imp {
            Some(("feature_importances", expected_imp, p.package.feature_importances.len()))
        } else {
            None
        };
        if let Some((field, expected, found)) = mismatch {
            return Err(PipelineError::Validation {
                participant: p.participant_id.clone(),
                source: ValidationFailure::ShapeMismatch { field, expected, found },
            });
        }
    }
    Ok(())
}

pub fn combine(packages: &[ParticipantPackage]) -> Result<GlobalModelSpec, PipelineError> {
    validate_shapes(packages)?;
    let first = &packages[0].package;
    let n = packages.len() as f64;

    let predictions = elementwise_mean(packages.iter().map(|p| p.package.predictions.as_slice()), first.predictions.len(), n);
    let feature_importances =
        elementwise_mean(packages.iter().map(|p| p.package.feature_importances.as_slice()), first.feature_importances.len(), n);

    let est_sum: u64 = packages.iter().map(|p| u64::from(p.package.n_estimators)).sum();
    let n_estimators = ((est_sum as f64 / n).round() as u32).max(1);

    let bounded: Vec<u32> = packages.iter().filter_map(|p| p.package.max_depth.limit()).collect();
    let max_depth = if bounded.is_empty() {
        MaxDepth::Unbounded
    } else {
        let mean = bounded.iter().map(|d| u64::from(*d)).sum::<u64>() as f64 / bounded.len() as f64;
        match mean.floor() as u32 { 0 => MaxDepth::Unbounded, d => MaxDepth::Limited(d) }
    };

    debug!(
        participants = packages.len(),
        n_estimators,
        max_depth = ?max_depth.limit(),
        unbounded_depths = packages.len() - bounded.len(),
        "packages combined"
    );

    Ok(GlobalModelSpec {
        n_estimators,
        max_features: first.max_features.clone(),
        max_depth,
        predictions,
        feature_importances,
        participants: packages.iter().map(|p| p.participant_id.clone()).collect(),
    })
}

fn elementwise_mean<'a>(vectors: impl Iterator<Item = &'a [f64]>, len: usize, n: f64) -> Vec<f64> {
    let mut acc = vec![0.0f64; len];
    for v in vectors {
        // scale before summing so large finite inputs cannot overflow to inf
        for (a, x) in acc.iter_mut().zip(v) { *a += *x / n; }
    }
    acc
}
