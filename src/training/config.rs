use burn::prelude::*;

use super::TrainingError;

/// Hyper-parameters of the epoch loop shared by the U-Net and the 3-D CNN.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    /// Hard cap on the number of epochs, `0` trains until early stopping.
    #[config(default = 0)]
    pub max_epochs: usize,

    #[config(default = 4)]
    pub training_batch_size: usize,

    #[config(default = 16)]
    pub validation_batch_size: usize,

    /// Upper bound for the training batch size when it grows after a bad epoch.
    #[config(default = 256)]
    pub max_batch_size: usize,

    #[config(default = 5e-5)]
    pub learning_rate: f64,

    /// Learning rate decay never goes below this value.
    #[config(default = 1e-8)]
    pub min_learning_rate: f64,

    /// Relative improvement of the validation loss needed to reset the bad epoch count.
    #[config(default = 0.01)]
    pub delta: f64,

    #[config(default = 2)]
    pub early_stopping_rounds: usize,

    /// Grow the training batch size by 4x after a bad epoch.
    #[config(default = true)]
    pub increase_batch: bool,

    /// Divide the learning rate by 4 after a bad epoch once the batch size can't grow.
    #[config(default = false)]
    pub decay_learning_rate: bool,

    /// Number of validation batches scored for the ROC curve.
    #[config(default = 3)]
    pub roc_batches: usize,

    /// Worker threads of the training loader. Validation always runs in order on one thread.
    #[config(default = 4)]
    pub num_workers: usize,

    #[config(default = 42)]
    pub seed: u64,

    /// Fraction of patients used for training, the rest is validation.
    #[config(default = 0.7)]
    pub train_fraction: f64,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<(), TrainingError> {
        if self.training_batch_size == 0 || self.validation_batch_size == 0 {
            return Err(TrainingError::invalid_config("batch sizes must be > 0"));
        }
        if self.max_batch_size < self.training_batch_size {
            return Err(TrainingError::invalid_config(format!(
                "max batch size ({}) is smaller than the training batch size ({})",
                self.max_batch_size, self.training_batch_size
            )));
        }
        if !(self.learning_rate > 0.0) {
            return Err(TrainingError::invalid_config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.min_learning_rate < 0.0 || self.min_learning_rate > self.learning_rate {
            return Err(TrainingError::invalid_config(format!(
                "min learning rate must be in [0, {}], got {}",
                self.learning_rate, self.min_learning_rate
            )));
        }
        if !(self.delta >= 0.0) {
            return Err(TrainingError::invalid_config(format!(
                "delta must be non-negative, got {}",
                self.delta
            )));
        }
        if self.early_stopping_rounds == 0 {
            return Err(TrainingError::invalid_config(
                "early stopping rounds must be > 0",
            ));
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(TrainingError::invalid_config(format!(
                "train fraction must be in (0, 1), got {}",
                self.train_fraction
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrainingConfig::new();

        assert_eq!(config.training_batch_size, 4);
        assert_eq!(config.early_stopping_rounds, 2);
        assert!(config.increase_batch);
        assert!(!config.decay_learning_rate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_inconsistent_values() {
        let cases = [
            TrainingConfig::new().with_training_batch_size(0),
            TrainingConfig::new().with_max_batch_size(2),
            TrainingConfig::new().with_learning_rate(0.0),
            TrainingConfig::new().with_delta(-0.1),
            TrainingConfig::new().with_early_stopping_rounds(0),
            TrainingConfig::new().with_train_fraction(1.0),
            TrainingConfig::new().with_min_learning_rate(1.0),
        ];

        for config in cases {
            assert!(
                matches!(config.validate(), Err(TrainingError::InvalidConfig(_))),
                "{config}"
            );
        }
    }

    #[test]
    fn saves_and_loads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training.json");

        let config = TrainingConfig::new().with_max_epochs(12).with_delta(0.05);
        config.save(&path).unwrap();

        let loaded = TrainingConfig::load(&path).unwrap();
        assert_eq!(loaded.max_epochs, 12);
        assert_eq!(loaded.delta, 0.05);
    }
}
