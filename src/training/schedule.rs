//! Early stopping with dynamic batch growth.
//!
//! After every epoch the validation loss is compared to the best loss so far.
//! A bad epoch first tries to grow the batch size (or decay the learning rate)
//! and only counts towards early stopping once neither is possible anymore.

use super::TrainingConfig;

/// Factor applied to the batch size, and inversely to the learning rate, after a bad epoch.
pub const GROWTH_FACTOR: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Adjustment {
    BatchSize { from: usize, to: usize },
    LearningRate { from: f64, to: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EarlyStopping { rounds: usize },
    MaxEpochs(usize),
}

/// What happened at the end of an epoch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochDecision {
    pub epoch: usize,
    pub previous_best: f64,
    pub val_loss: f64,
    pub percent_change: f64,
    pub improved: bool,
    pub adjustment: Option<Adjustment>,
    pub stop: Option<StopReason>,
}

impl EpochDecision {
    pub fn should_stop(&self) -> bool {
        self.stop.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct TrainingSchedule {
    delta: f64,
    early_stopping_rounds: usize,
    increase_batch: bool,
    decay_learning_rate: bool,
    max_batch_size: usize,
    max_epochs: usize,
    min_learning_rate: f64,

    best_loss: f64,
    bad_epochs: usize,
    epoch: usize,
    batch_size: usize,
    learning_rate: f64,
}

impl TrainingSchedule {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            delta: config.delta,
            early_stopping_rounds: config.early_stopping_rounds,
            increase_batch: config.increase_batch,
            decay_learning_rate: config.decay_learning_rate,
            max_batch_size: config.max_batch_size,
            max_epochs: config.max_epochs,
            min_learning_rate: config.min_learning_rate,
            best_loss: f64::INFINITY,
            bad_epochs: 0,
            epoch: 0,
            batch_size: config.training_batch_size,
            learning_rate: config.learning_rate,
        }
    }

    /// Number of epochs already recorded.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn bad_epochs(&self) -> usize {
        self.bad_epochs
    }

    /// Record the validation loss of the epoch that just finished.
    pub fn record(&mut self, val_loss: f64) -> EpochDecision {
        self.epoch += 1;

        let previous_best = self.best_loss;
        let percent_change = (previous_best - val_loss) / val_loss * 100.0;
        let improved = val_loss * (1.0 + self.delta) < previous_best;

        if improved {
            tracing::info!(
                "Loss improved by {:.2} percent ({:.3} -> {:.3}), continuing for another epoch",
                percent_change,
                previous_best,
                val_loss
            );
            self.best_loss = val_loss;
            self.bad_epochs = 0;
        } else {
            tracing::info!(
                "Change in loss was {:.2} percent ({:.3} -> {:.3}), incrementing bad epochs by 1",
                percent_change,
                previous_best,
                val_loss
            );
            self.bad_epochs += 1;
        }

        let adjustment = if self.bad_epochs >= 1 {
            self.adjust()
        } else {
            None
        };

        let stop = if self.bad_epochs >= self.early_stopping_rounds {
            tracing::info!(
                "{} early stopping rounds without an improvement of at least {:.2} percent, stopping after {} epochs",
                self.early_stopping_rounds,
                self.delta * 100.0,
                self.epoch
            );
            Some(StopReason::EarlyStopping {
                rounds: self.early_stopping_rounds,
            })
        } else if self.max_epochs > 0 && self.epoch >= self.max_epochs {
            tracing::info!("Maximum number of training epochs ({}) reached", self.max_epochs);
            Some(StopReason::MaxEpochs(self.max_epochs))
        } else {
            None
        };

        EpochDecision {
            epoch: self.epoch,
            previous_best,
            val_loss,
            percent_change,
            improved,
            adjustment,
            stop,
        }
    }

    fn adjust(&mut self) -> Option<Adjustment> {
        let grown = self.batch_size * GROWTH_FACTOR;
        if self.increase_batch && grown <= self.max_batch_size {
            tracing::info!(
                "Increasing batch size from {} -> {}, resetting bad epochs",
                self.batch_size,
                grown
            );
            let adjustment = Adjustment::BatchSize {
                from: self.batch_size,
                to: grown,
            };
            self.batch_size = grown;
            self.bad_epochs = 0;
            return Some(adjustment);
        }

        let decayed = self.learning_rate / GROWTH_FACTOR as f64;
        if self.decay_learning_rate && decayed >= self.min_learning_rate {
            tracing::info!(
                "Decaying learning rate from {:e} -> {:e}, resetting bad epochs",
                self.learning_rate,
                decayed
            );
            let adjustment = Adjustment::LearningRate {
                from: self.learning_rate,
                to: decayed,
            };
            self.learning_rate = decayed;
            self.bad_epochs = 0;
            return Some(adjustment);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(config: TrainingConfig) -> TrainingSchedule {
        TrainingSchedule::from_config(&config)
    }

    #[test]
    fn first_epoch_always_improves() {
        let mut schedule = schedule(TrainingConfig::new());

        let decision = schedule.record(0.7);

        assert!(decision.improved);
        assert_eq!(decision.previous_best, f64::INFINITY);
        assert_eq!(decision.adjustment, None);
        assert_eq!(decision.stop, None);
        assert_eq!(schedule.best_loss(), 0.7);
    }

    #[test]
    fn improvement_must_exceed_delta() {
        let mut schedule = schedule(
            TrainingConfig::new()
                .with_increase_batch(false)
                .with_delta(0.1)
                .with_early_stopping_rounds(3),
        );
        schedule.record(1.0);

        // 0.95 * 1.1 = 1.045 is not below 1.0
        let decision = schedule.record(0.95);
        assert!(!decision.improved);
        assert_eq!(schedule.bad_epochs(), 1);
        assert_eq!(schedule.best_loss(), 1.0);

        // 0.8 * 1.1 = 0.88
        let decision = schedule.record(0.8);
        assert!(decision.improved);
        assert_eq!(schedule.bad_epochs(), 0);
        assert!((decision.percent_change - 25.0).abs() < 1e-9);
    }

    #[test]
    fn bad_epoch_grows_batch_until_cap() {
        let mut schedule = schedule(
            TrainingConfig::new()
                .with_training_batch_size(4)
                .with_max_batch_size(64),
        );
        schedule.record(1.0);

        let decision = schedule.record(1.0);
        assert_eq!(
            decision.adjustment,
            Some(Adjustment::BatchSize { from: 4, to: 16 })
        );
        assert_eq!(schedule.bad_epochs(), 0);

        let decision = schedule.record(1.0);
        assert_eq!(
            decision.adjustment,
            Some(Adjustment::BatchSize { from: 16, to: 64 })
        );
        assert_eq!(decision.stop, None);

        // 256 > 64, the bad epochs accumulate from now on
        let decision = schedule.record(1.0);
        assert_eq!(decision.adjustment, None);
        assert_eq!(decision.stop, None);
        let decision = schedule.record(1.0);
        assert_eq!(decision.stop, Some(StopReason::EarlyStopping { rounds: 2 }));
        assert_eq!(schedule.batch_size(), 64);
    }

    #[test]
    fn learning_rate_decays_once_batch_is_capped() {
        let mut schedule = schedule(
            TrainingConfig::new()
                .with_training_batch_size(4)
                .with_max_batch_size(4)
                .with_learning_rate(1e-3)
                .with_min_learning_rate(1e-4)
                .with_decay_learning_rate(true),
        );
        schedule.record(1.0);

        let decision = schedule.record(2.0);
        assert_eq!(
            decision.adjustment,
            Some(Adjustment::LearningRate {
                from: 1e-3,
                to: 2.5e-4
            })
        );
        assert_eq!(schedule.learning_rate(), 2.5e-4);

        // 6.25e-5 would fall below the floor
        let decision = schedule.record(2.0);
        assert_eq!(decision.adjustment, None);
        assert_eq!(schedule.bad_epochs(), 1);
    }

    #[test]
    fn early_stopping_without_adjustments() {
        let mut schedule = schedule(TrainingConfig::new().with_increase_batch(false));

        schedule.record(0.5);
        assert!(!schedule.record(0.6).should_stop());
        let decision = schedule.record(0.6);

        assert!(decision.should_stop());
        assert_eq!(decision.epoch, 3);
    }

    #[test]
    fn stops_at_epoch_cap() {
        let mut schedule = schedule(TrainingConfig::new().with_max_epochs(2));

        assert!(!schedule.record(0.9).should_stop());
        let decision = schedule.record(0.5);

        assert!(decision.improved);
        assert_eq!(decision.stop, Some(StopReason::MaxEpochs(2)));
    }

    #[test]
    fn nan_loss_counts_as_bad_epoch() {
        let mut schedule = schedule(TrainingConfig::new().with_increase_batch(false));
        schedule.record(0.5);

        let decision = schedule.record(f64::NAN);

        assert!(!decision.improved);
        assert_eq!(schedule.bad_epochs(), 1);
        assert_eq!(schedule.best_loss(), 0.5);
    }
}
