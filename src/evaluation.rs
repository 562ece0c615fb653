//! Receiver operating characteristic for binary predictions.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RocError {
    #[error("labels ({labels}) and scores ({scores}) have different lengths")]
    LengthMismatch { labels: usize, scores: usize },

    #[error("cannot compute a ROC curve without samples")]
    Empty,

    #[error("only one class present in labels, ROC AUC is undefined")]
    SingleClass,

    #[error("score at index {0} is not finite")]
    NonFiniteScore(usize),
}

/// Points of the ROC curve, ordered by decreasing threshold.
///
/// The first point is always `(0, 0)` with an infinite threshold so the
/// curve starts at the origin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    pub thresholds: Vec<f64>,
}

impl RocCurve {
    /// Area under the curve using the trapezoidal rule.
    pub fn auc(&self) -> f64 {
        self.fpr
            .windows(2)
            .zip(self.tpr.windows(2))
            .map(|(x, y)| (x[1] - x[0]) * (y[1] + y[0]) / 2.0)
            .sum()
    }
}

/// Compute the ROC curve of `scores` against binary `labels`.
///
/// A label counts as positive when it is `>= 0.5`. Every distinct score is
/// used as a threshold.
pub fn roc_curve(labels: &[f32], scores: &[f32]) -> Result<RocCurve, RocError> {
    if labels.len() != scores.len() {
        return Err(RocError::LengthMismatch {
            labels: labels.len(),
            scores: scores.len(),
        });
    }
    if labels.is_empty() {
        return Err(RocError::Empty);
    }
    if let Some(index) = scores.iter().position(|score| !score.is_finite()) {
        return Err(RocError::NonFiniteScore(index));
    }

    let positives = labels.iter().filter(|&&label| label >= 0.5).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(RocError::SingleClass);
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
    });

    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut thresholds = vec![f64::INFINITY];

    let (mut true_positives, mut false_positives) = (0usize, 0usize);
    for (rank, &index) in order.iter().enumerate() {
        if labels[index] >= 0.5 {
            true_positives += 1;
        } else {
            false_positives += 1;
        }

        // emit a point only once all samples sharing this score are counted
        let last_of_score = order
            .get(rank + 1)
            .is_none_or(|&next| scores[next] != scores[index]);
        if last_of_score {
            fpr.push(false_positives as f64 / negatives as f64);
            tpr.push(true_positives as f64 / positives as f64);
            thresholds.push(scores[index] as f64);
        }
    }

    Ok(RocCurve {
        fpr,
        tpr,
        thresholds,
    })
}

/// False positive rates, true positive rates and the area under the curve.
pub fn calc_auc(labels: &[f32], scores: &[f32]) -> Result<(Vec<f64>, Vec<f64>, f64), RocError> {
    let curve = roc_curve(labels, scores)?;
    let auc = curve.auc();

    Ok((curve.fpr, curve.tpr, auc))
}
