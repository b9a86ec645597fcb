//! Random forest classifier over the global spec's hyperparameters, backed by
//! smartcore's Gini-split ensemble.

use smartcore::ensemble::random_forest_classifier::{RandomForestClassifier, RandomForestClassifierParameters};
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::tree::decision_tree_classifier::SplitCriterion;

use crate::error::EvaluationFailure;
use crate::package::{MaxDepth, MaxFeatures};

#[derive(Debug, Clone)]
pub struct ForestParams {
    pub n_estimators: u32,
    pub max_features: MaxFeatures,
    pub max_depth: MaxDepth,
    pub min_samples_split: usize,
    pub seed: u64,
}

/// Number of candidate features examined at each split, for `n_features` columns.
pub fn resolve_max_features(mf: &MaxFeatures, n_features: usize) -> Result<usize, EvaluationFailure> {
    let d = n_features.max(1);
    let k = match mf {
        MaxFeatures::Count(k) => usize::try_from(*k).unwrap_or(usize::MAX).min(d),
        MaxFeatures::Named(name) => match name.to_ascii_lowercase().as_str() {
            "sqrt" | "auto" => (d as f64).sqrt().floor() as usize,
            "log2" => (d as f64).log2().floor() as usize,
            "all" | "none" => d,
            other => return Err(EvaluationFailure::InvalidHyperparameter(format!("unsupported max_features {other:?}"))),
        },
    };
    Ok(k.max(1))
}

type Classifier = RandomForestClassifier<f64, u32, DenseMatrix<f64>, Vec<u32>>;

enum Fitted {
    Ensemble(Box<Classifier>),
    /// Training labels held one class only; every row gets that class.
    Constant(bool),
}

pub struct RandomForest {
    fitted: Fitted,
    n_trees: u16,
}

impl RandomForest {
    /// Bootstrap ensemble seeded from `params.seed`; identical inputs give identical predictions.
    pub fn fit(rows: &[Vec<f64>], labels: &[bool], params: &ForestParams) -> Result<Self, EvaluationFailure> {
        if rows.is_empty() || rows.len() != labels.len() {
            return Err(EvaluationFailure::BadDataset(format!("{} rows with {} labels", rows.len(), labels.len())));
        }
        let n_trees = match u16::try_from(params.n_estimators) {
            Ok(0) => return Err(EvaluationFailure::InvalidHyperparameter("n_estimators must be at least 1".into())),
            Ok(n) => n,
            Err(_) => {
                return Err(EvaluationFailure::InvalidHyperparameter(format!(
                    "n_estimators {} exceeds {}",
                    params.n_estimators,
                    u16::MAX
                )))
            }
        };
        let m = resolve_max_features(&params.max_features, rows[0].len())?;

        let positives = labels.iter().filter(|&&l| l).count();
        if positives == 0 || positives == labels.len() {
            return Ok(Self { fitted: Fitted::Constant(positives > 0), n_trees });
        }

        let mut forest_params = RandomForestClassifierParameters::default()
            .with_criterion(SplitCriterion::Gini)
            .with_n_trees(n_trees)
            .with_m(m)
            .with_min_samples_split(params.min_samples_split.max(2))
            .with_seed(params.seed);
        if let Some(depth) = params.max_depth.limit() {
            forest_params = forest_params.with_max_depth(depth.clamp(1, u32::from(u16::MAX)) as u16);
        }

        let x = DenseMatrix::from_2d_vec(&rows.to_vec());
        let y: Vec<u32> = labels.iter().map(|&l| u32::from(l)).collect();
        let model = Classifier::fit(&x, &y, forest_params).map_err(|e| EvaluationFailure::Training(e.to_string()))?;
        Ok(Self { fitted: Fitted::Ensemble(Box::new(model)), n_trees })
    }

    pub fn n_trees(&self) -> usize { usize::from(self.n_trees) }

    /// Majority vote of the trees for each row.
    pub fn predict(&self, rows: &[Vec<f64>]) -> Result<Vec<bool>, EvaluationFailure> {
        match &self.fitted {
            Fitted::Constant(class) => Ok(vec![*class; rows.len()]),
            Fitted::Ensemble(_) if rows.is_empty() => Ok(Vec::new()),
            Fitted::Ensemble(model) => {
                let x = DenseMatrix::from_2d_vec(&rows.to_vec());
                let votes = model.predict(&x).map_err(|e| EvaluationFailure::Training(e.to_string()))?;
                Ok(votes.into_iter().map(|v| v == 1).collect())
            }
        }
    }
}
