//! Labeled tabular data: numeric feature columns plus a binary target column.

use std::io::Read;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::EvaluationFailure;

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledDataset {
    pub feature_names: Vec<String>,
    /// Row-major feature matrix.
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<bool>,
}

fn bad(msg: impl Into<String>) -> EvaluationFailure { EvaluationFailure::BadDataset(msg.into()) }

impl LabeledDataset {
    pub fn from_csv_path(path: impl AsRef<Path>, target: &str) -> Result<Self, EvaluationFailure> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| bad(format!("{}: {e}", path.display())))?;
        Self::from_reader(file, target)
    }

    /// Reads CSV with a header row. Every non-target cell must be a finite number;
    /// target cells must be 0 or 1.
    pub fn from_reader<R: Read>(reader: R, target: &str) -> Result<Self, EvaluationFailure> {
        let mut rdr = csv::ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_reader(reader);
        let headers = rdr.headers().map_err(|e| bad(e.to_string()))?.clone();
        let target_idx = headers
            .iter()
            .position(|h| h == target)
            .ok_or_else(|| bad(format!("target column {target:?} not found")))?;
        let feature_names: Vec<String> =
            headers.iter().enumerate().filter(|(i, _)| *i != target_idx).map(|(_, h)| h.to_string()).collect();
        if feature_names.is_empty() {
            return Err(bad("dataset has no feature columns"));
        }

        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record.map_err(|e| bad(e.to_string()))?;
            let row_no = line + 2;
            let mut row = Vec::with_capacity(feature_names.len());
            for (i, cell) in record.iter().enumerate() {
                let value: f64 = cell
                    .parse()
                    .ok()
                    .filter(|v: &f64| v.is_finite())
                    .ok_or_else(|| bad(format!("row {row_no}, column {}: {cell:?} is not a finite number", headers.get(i).unwrap_or("?"))))?;
                if i == target_idx {
                    labels.push(match value {
                        v if v == 0.0 => false,
                        v if v == 1.0 => true,
                        _ => return Err(bad(format!("row {row_no}: target {cell:?} is not 0 or 1"))),
                    });
                } else {
                    row.push(value);
                }
            }
            rows.push(row);
        }
        if rows.is_empty() {
            return Err(bad("dataset has no rows"));
        }
        Ok(Self { feature_names, rows, labels })
    }

    pub fn len(&self) -> usize { self.rows.len() }

    pub fn is_empty(&self) -> bool { self.rows.is_empty() }

    pub fn n_features(&self) -> usize { self.feature_names.len() }

    pub fn positives(&self) -> usize { self.labels.iter().filter(|l| **l).count() }

    /// Shuffles row indices with `seed` and returns `(train, test)`, the test part
    /// holding `ceil(len * test_fraction)` rows. Both parts must be non-empty.
    pub fn split(&self, test_fraction: f64, seed: u64) -> Result<(LabeledDataset, LabeledDataset), EvaluationFailure> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(bad(format!("test fraction {test_fraction} outside (0, 1)")));
        }
        let n = self.len();
        let n_test = (n as f64 * test_fraction).ceil() as usize;
        if n_test == 0 || n_test >= n {
            return Err(bad(format!("{n} rows cannot be split into non-empty train and test sets")));
        }
        let mut idx: Vec<usize> = (0..n).collect();
        idx.shuffle(&mut StdRng::seed_from_u64(seed));
        let (test_idx, train_idx) = idx.split_at(n_test);
        Ok((self.subset(train_idx), self.subset(test_idx)))
    }

    fn subset(&self, idx: &[usize]) -> LabeledDataset {
        LabeledDataset {
            feature_names: self.feature_names.clone(),
            rows: idx.iter().map(|&i| self.rows[i].clone()).collect(),
            labels: idx.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}
