// Evaluation metrics kept across an epoch
//
// Two buffers carry per-minibatch statistics from an evaluator to Decision:
//
//   minibatch_metrics           [sum_err, max_err, min_err]
//   minibatch_confusion_matrix  [k, k], entry [t * k + p] counts samples of
//                               true label t predicted as p
//
// The evaluator folds every sample into them; Decision reads them on the last
// minibatch of a class and resets them. The min slot starts at a large
// sentinel so the first fold always replaces it.

use serde::{Deserialize, Serialize};

/// Initial value of the min slot of a metrics buffer.
pub const MIN_SENTINEL: f64 = 1.0e30;

/// Slots of a metrics buffer.
pub const METRIC_SUM: usize = 0;
pub const METRIC_MAX: usize = 1;
pub const METRIC_MIN: usize = 2;

/// Fold one sample's error into a `[sum, max, min]` metrics array.
pub fn fold_error(metrics: &mut [f64], err: f64) {
    metrics[METRIC_SUM] += err;
    metrics[METRIC_MAX] = metrics[METRIC_MAX].max(err);
    metrics[METRIC_MIN] = metrics[METRIC_MIN].min(err);
}

/// Reset a metrics array to its empty state.
pub fn reset_metrics(metrics: &mut [f64]) {
    metrics.fill(0.0);
    if metrics.len() > METRIC_MIN {
        metrics[METRIC_MIN] = MIN_SENTINEL;
    }
}

// Confusion matrix

/// NxN confusion matrix. Entry [i][j] = count of samples with true class i
/// predicted as class j.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub matrix: Vec<Vec<u64>>,
    pub n_classes: usize,
}

impl ConfusionMatrix {
    /// Build from a row-major `[k, k]` counts array as found in a buffer.
    pub fn from_flat(counts: &[f64], n_classes: usize) -> Self {
        let matrix = (0..n_classes)
            .map(|t| {
                (0..n_classes)
                    .map(|p| counts.get(t * n_classes + p).copied().unwrap_or(0.0).max(0.0) as u64)
                    .collect()
            })
            .collect();
        Self { matrix, n_classes }
    }

    pub fn total(&self) -> u64 {
        self.matrix.iter().flat_map(|r| r.iter()).sum()
    }

    /// Misclassified samples: everything off the diagonal.
    pub fn errors(&self) -> u64 {
        self.total() - (0..self.n_classes).map(|c| self.matrix[c][c]).sum::<u64>()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (total - self.errors()) as f64 / total as f64
    }

    /// Pretty-print the confusion matrix.
    pub fn to_string_table(&self) -> String {
        let mut s = format!("{:>8}", "");
        for c in 0..self.n_classes {
            s.push_str(&format!("{:>8}", format!("Pred {c}")));
        }
        s.push('\n');
        for r in 0..self.n_classes {
            s.push_str(&format!("{:>8}", format!("True {r}")));
            for c in 0..self.n_classes {
                s.push_str(&format!("{:>8}", self.matrix[r][c]));
            }
            s.push('\n');
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_errors() {
        let cm = ConfusionMatrix::from_flat(&[1., 0., 0., 0., 1., 0., 0., 1., 1.], 3);
        assert_eq!(cm.matrix[2], [0, 1, 1]);
        assert_eq!(cm.total(), 4);
        assert_eq!(cm.errors(), 1);
        assert_eq!(cm.accuracy(), 0.75);
    }

    #[test]
    fn flat_counts_are_clamped_and_padded() {
        let cm = ConfusionMatrix::from_flat(&[-2.0, 3.0, 1.0], 2);
        assert_eq!(cm.matrix, [[0, 3], [1, 0]]);
        assert_eq!(cm.errors(), 4);
    }

    #[test]
    fn metrics_fold_from_reset() {
        let mut m = [0.0; 3];
        reset_metrics(&mut m);
        fold_error(&mut m, 0.5);
        fold_error(&mut m, 0.25);
        assert_eq!(m, [0.75, 0.5, 0.25]);
    }
}
