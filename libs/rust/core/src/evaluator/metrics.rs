use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub true_positives: usize,
    pub false_positives: usize,
    pub true_negatives: usize,
    pub false_negatives: usize,
}

impl ConfusionMatrix {
    pub fn tally(actual: &[bool], predicted: &[bool]) -> Self {
        let mut m = Self::default();
        for (&a, &p) in actual.iter().zip(predicted) {
            match (a, p) {
                (true, true) => m.true_positives += 1,
                (false, true) => m.false_positives += 1,
                (false, false) => m.true_negatives += 1,
                (true, false) => m.false_negatives += 1,
            }
        }
        m
    }

    pub fn total(&self) -> usize { self.true_positives + self.false_positives + self.true_negatives + self.false_negatives }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub test_samples: usize,
    pub confusion: ConfusionMatrix,
}

/// `num / den`, or exactly 1.0 when there is nothing to measure.
fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 { 1.0 } else { num as f64 / den as f64 }
}

impl From<ConfusionMatrix> for EvaluationMetrics {
    fn from(m: ConfusionMatrix) -> Self {
        let tp = m.true_positives;
        Self {
            accuracy: ratio(tp + m.true_negatives, m.total()),
            precision: ratio(tp, tp + m.false_positives),
            recall: ratio(tp, tp + m.false_negatives),
            f1: ratio(2 * tp, 2 * tp + m.false_positives + m.false_negatives),
            test_samples: m.total(),
            confusion: m,
        }
    }
}
