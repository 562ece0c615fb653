use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Fraction of elements where thresholding the prediction at 0.5 matches the target.
pub fn binary_accuracy<B: Backend, const D: usize>(
    predictions: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> f64 {
    let predicted = predictions.greater_equal_elem(0.5);
    let actual = targets.greater_equal_elem(0.5);

    predicted
        .equal(actual)
        .float()
        .mean()
        .into_scalar()
        .elem::<f64>()
}

/// Batch-size weighted running means keyed by metric name.
#[derive(Clone, Debug, Default)]
pub struct MetricsAccumulator {
    totals: BTreeMap<String, (f64, usize)>,
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, name: &str, value: f64, batch_size: usize) {
        let entry = self.totals.entry(name.to_string()).or_insert((0.0, 0));
        entry.0 += value * batch_size as f64;
        entry.1 += batch_size;
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        self.totals
            .get(name)
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| sum / *count as f64)
    }

    pub fn means(&self) -> BTreeMap<String, f64> {
        self.totals
            .iter()
            .filter(|(_, (_, count))| *count > 0)
            .map(|(name, (sum, count))| (name.clone(), sum / *count as f64))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

/// Everything recorded about one epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub train: BTreeMap<String, f64>,
    pub valid: BTreeMap<String, f64>,
    pub skipped_batches: usize,
    pub improved: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fpr: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tpr: Vec<f64>,
    pub auc: Option<f64>,
    pub duration_secs: f64,
}

/// Epoch records of a training run, written to disk after every epoch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    pub fn best_valid_loss(&self) -> Option<f64> {
        self.epochs
            .iter()
            .filter_map(|record| record.valid.get("loss").copied())
            .filter(|loss| loss.is_finite())
            .reduce(f64::min)
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self).map_err(std::io::Error::other)?;
        writer.flush()
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(std::io::Error::other)
    }
}
