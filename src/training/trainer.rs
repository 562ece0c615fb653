//! Epoch loop with early stopping and dynamic batch growth.
//!
//! Burn's `Learner` fixes the dataloader for the whole run, so the loop is
//! written out here: the training loader is rebuilt every epoch with the batch
//! size chosen by the [TrainingSchedule] while the optimizer state is kept.

use std::fmt::{Debug, Display};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder, batcher::Batcher},
        dataset::Dataset,
    },
    module::AutodiffModule,
    optim::Optimizer,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
    train::{TrainStep, ValidStep},
};

use super::{
    EpochRecord, MetricsAccumulator, PredictionOutput, StopReason, TrainingConfig, TrainingError,
    TrainingHistory, TrainingSchedule,
};
use crate::evaluation::{RocCurve, roc_curve};

pub const CHECKPOINT_NAME: &str = "model";
pub const BEST_CHECKPOINT_NAME: &str = "model_best";
pub const HISTORY_FILE: &str = "metrics.json";
pub const CONFIG_FILE: &str = "training.json";

/// Loss and reporting metrics of one pass over a dataloader, plus the ROC
/// curve of the scored batches.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub metrics: MetricsAccumulator,
    pub roc: Option<RocCurve>,
    /// Predictions that went into the ROC curve.
    pub roc_samples: usize,
    pub skipped_batches: usize,
}

impl Evaluation {
    pub fn loss(&self) -> f64 {
        self.metrics.mean("loss").unwrap_or(f64::NAN)
    }

    pub fn auc(&self) -> Option<f64> {
        self.roc.as_ref().map(RocCurve::auc)
    }
}

fn record_batch<B: Backend, const R: usize>(
    metrics: &mut MetricsAccumulator,
    output: &PredictionOutput<B, R>,
    loss: f64,
) {
    let batch_size = output.batch_size();
    metrics.update("loss", loss, batch_size);
    for (name, value) in output.report.entries() {
        if value.is_finite() {
            metrics.update(name, value, batch_size);
        }
    }
}

/// Run `model` over every batch of `loader`.
///
/// Predictions of the first `roc_batches` batches are kept for the ROC curve,
/// `None` scores every batch.
pub fn evaluate<B, M, VB, const R: usize>(
    model: &M,
    loader: &dyn DataLoader<VB>,
    roc_batches: Option<usize>,
) -> Result<Evaluation, TrainingError>
where
    B: Backend,
    M: ValidStep<VB, PredictionOutput<B, R>>,
{
    let mut metrics = MetricsAccumulator::new();
    let mut skipped_batches = 0;
    let mut scores = Vec::new();
    let mut labels = Vec::new();

    for (index, batch) in loader.iter().enumerate() {
        let output = model.step(batch);
        let loss = output.loss_value();

        if loss.is_finite() {
            record_batch(&mut metrics, &output, loss);
        } else {
            tracing::warn!("Non-finite validation loss in batch {}", index + 1);
            skipped_batches += 1;
        }

        if roc_batches.is_none_or(|limit| index < limit) {
            let (batch_scores, batch_labels) = output.scores_and_labels()?;
            scores.extend(batch_scores);
            labels.extend(batch_labels);
        }
    }

    let roc = match roc_curve(&labels, &scores) {
        Ok(curve) => Some(curve),
        Err(err) => {
            tracing::warn!("Skipping ROC curve: {}", err);
            None
        }
    };

    Ok(Evaluation {
        metrics,
        roc,
        roc_samples: scores.len(),
        skipped_batches,
    })
}

/// Final model and the history of every epoch.
pub struct FitResult<M> {
    pub model: M,
    pub history: TrainingHistory,
    pub stop: StopReason,
}

pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    artifact_dir: PathBuf,
    device: B::Device,
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Validate the config, create the artifact directory and save the config in it.
    pub fn new(
        config: TrainingConfig,
        artifact_dir: impl Into<PathBuf>,
        device: B::Device,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let artifact_dir = artifact_dir.into();
        std::fs::create_dir_all(&artifact_dir)?;
        config.save(artifact_dir.join(CONFIG_FILE))?;

        B::seed(config.seed);

        Ok(Self {
            config,
            artifact_dir,
            device,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Train until early stopping or the epoch cap.
    ///
    /// Every epoch writes the `model` checkpoint and the history file, and the
    /// `model_best` checkpoint when the validation loss improved.
    #[allow(clippy::too_many_arguments)]
    pub fn fit<M, O, I, D, BT, BV, TB, VB, const R: usize>(
        &self,
        mut model: M,
        mut optimizer: O,
        dataset_train: D,
        dataset_valid: D,
        batcher_train: BT,
        batcher_valid: BV,
    ) -> Result<FitResult<M>, TrainingError>
    where
        M: AutodiffModule<B> + TrainStep<TB, PredictionOutput<B, R>> + Display + 'static,
        M::InnerModule: ValidStep<VB, PredictionOutput<B::InnerBackend, R>>,
        O: Optimizer<M, B>,
        I: Send + Sync + Clone + Debug + 'static,
        D: Dataset<I> + Clone + 'static,
        BT: Batcher<I, TB> + Clone + 'static,
        BV: Batcher<I, VB> + Clone + 'static,
        TB: Send + Clone + Debug + 'static,
        VB: Send + Clone + Debug + 'static,
    {
        tracing::info!(
            "Training on {} items, validating on {} items",
            dataset_train.len(),
            dataset_valid.len()
        );
        tracing::debug!("{}", model);

        let dataloader_valid = self.validation_loader(batcher_valid, dataset_valid);

        let mut schedule = TrainingSchedule::from_config(&self.config);
        let mut history = TrainingHistory::default();

        loop {
            let epoch = schedule.epoch() + 1;
            let batch_size = schedule.batch_size();
            let learning_rate = schedule.learning_rate();
            let epoch_start = Instant::now();

            tracing::info!(
                "On epoch {} of training (batch size {}, learning rate {:e})",
                epoch,
                batch_size,
                learning_rate
            );

            let dataloader_train = DataLoaderBuilder::new(batcher_train.clone())
                .batch_size(batch_size)
                .shuffle(self.config.seed.wrapping_add(epoch as u64))
                .num_workers(self.config.num_workers)
                .build(dataset_train.clone());

            let mut train_metrics = MetricsAccumulator::new();
            let mut skipped_batches = 0;

            for (iteration, batch) in dataloader_train.iter().enumerate() {
                let output = TrainStep::step(&model, batch);
                let loss = output.item.loss_value();

                if !loss.is_finite() {
                    tracing::warn!(
                        "Non-finite loss at epoch {} batch {}, skipping optimizer step",
                        epoch,
                        iteration + 1
                    );
                    skipped_batches += 1;
                    continue;
                }

                record_batch(&mut train_metrics, &output.item, loss);
                model = optimizer.step(learning_rate, model, output.grads);

                if (iteration + 1) % 50 == 0 {
                    tracing::debug!("Batch {}: loss={:.4}", iteration + 1, loss);
                }
            }

            if train_metrics.is_empty() {
                return Err(TrainingError::EmptyEpoch(epoch));
            }

            let validation = evaluate(
                &model.valid(),
                dataloader_valid.as_ref(),
                Some(self.config.roc_batches),
            )?;
            let val_loss = validation.loss();

            self.save_checkpoint(&model, CHECKPOINT_NAME)?;

            let decision = schedule.record(val_loss);
            if decision.improved {
                self.save_checkpoint(&model, BEST_CHECKPOINT_NAME)?;
            }

            let (fpr, tpr) = validation
                .roc
                .as_ref()
                .map(|curve| (curve.fpr.clone(), curve.tpr.clone()))
                .unwrap_or_default();

            history.push(EpochRecord {
                epoch,
                batch_size,
                learning_rate,
                train: train_metrics.means(),
                valid: validation.metrics.means(),
                skipped_batches: skipped_batches + validation.skipped_batches,
                improved: decision.improved,
                fpr,
                tpr,
                auc: validation.auc(),
                duration_secs: epoch_start.elapsed().as_secs_f64(),
            });
            history.save(&self.artifact_dir.join(HISTORY_FILE))?;

            tracing::info!(
                "Epoch {}: train loss {:.4}, valid loss {:.4}, auc {}, {:.1}s",
                epoch,
                train_metrics.mean("loss").unwrap_or(f64::NAN),
                val_loss,
                validation
                    .auc()
                    .map_or_else(|| "n/a".to_string(), |auc| format!("{auc:.3}")),
                epoch_start.elapsed().as_secs_f32()
            );

            if let Some(stop) = decision.stop {
                return Ok(FitResult {
                    model,
                    history,
                    stop,
                });
            }
        }
    }

    /// Single-threaded loader over `dataset` in its own order, so the first
    /// `roc_batches` batches hold the same items every epoch. Worker threads
    /// would hand batches over in completion order.
    pub fn validation_loader<I, VB, BV, D>(
        &self,
        batcher: BV,
        dataset: D,
    ) -> Arc<dyn DataLoader<VB>>
    where
        I: Send + Sync + Clone + Debug + 'static,
        VB: Send + Clone + Debug + 'static,
        BV: Batcher<I, VB> + Clone + 'static,
        D: Dataset<I> + 'static,
    {
        DataLoaderBuilder::new(batcher)
            .batch_size(self.config.validation_batch_size)
            .build(dataset)
    }

    fn save_checkpoint<M: Module<B>>(&self, model: &M, name: &str) -> Result<(), TrainingError> {
        let path = self.artifact_dir.join(name);
        tracing::debug!("Saving checkpoint {}", path.display());

        model
            .clone()
            .save_file(path, &CompactRecorder::new())
            .map_err(|err| TrainingError::Checkpoint(format!("{err:?}")))
    }
}


#[cfg(all(test, feature = "unet", feature = "cnn3d"))]
mod tests {
    use super::*;
    use crate::dataset::{
        PatientMetadata, PatientVolume, SegmentationBatcher, SliceDataset, VolumeArchive,
        VolumeBatcher, VolumeDataset,
    };
    use crate::model::{Activation, Cnn3dConfig, UNet2p5dConfig};
    use crate::training::{LossKind, SegmentationLossConfig};
    use burn::backend::{Autodiff, NdArray};
    use burn::optim::AdamConfig;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("p{i}")).collect()
    }

    /// Volumes whose mask marks the bright half of every slice.
    fn archive(n: usize, depth: usize) -> (VolumeArchive, PatientMetadata) {
        let mut archive = VolumeArchive::new();
        let mut metadata = PatientMetadata::default();

        for (i, id) in ids(n).into_iter().enumerate() {
            let slice: Vec<f32> = (0..16).map(|v| if v < 8 { 100.0 } else { 0.0 }).collect();
            let mask: Vec<u8> = slice.iter().map(|&v| u8::from(v > 0.0)).collect();
            let voxels = slice.iter().cycle().take(depth * 16).copied().collect();
            let mask = mask.iter().cycle().take(depth * 16).copied().collect();

            archive
                .push(PatientVolume::new(id.clone(), [depth, 4, 4], voxels, Some(mask)).unwrap())
                .unwrap();
            metadata.insert(id, (i % 2) as u8);
        }

        (archive, metadata)
    }

    fn training_config() -> TrainingConfig {
        TrainingConfig::new()
            .with_max_epochs(2)
            .with_training_batch_size(2)
            .with_validation_batch_size(2)
            .with_learning_rate(1e-3)
            .with_num_workers(1)
    }

    #[test]
    fn fits_unet_and_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let (archive, _) = archive(4, 2);
        let patients = ids(4);

        let train = SliceDataset::new(&archive, &patients[..3], 1).unwrap();
        let valid = SliceDataset::new(&archive, &patients[3..], 1).unwrap();

        let model = UNet2p5dConfig::new(train.channels())
            .with_n_filters(2)
            .with_n_layers_unet(2)
            .with_n_layers_conv(1)
            .init::<TestAutodiffBackend>(&device);

        let trainer =
            Trainer::<TestAutodiffBackend>::new(training_config(), dir.path(), device).unwrap();
        let result = trainer
            .fit(
                model,
                AdamConfig::new().init(),
                train,
                valid,
                SegmentationBatcher::<TestAutodiffBackend>::new(Default::default()),
                SegmentationBatcher::<TestBackend>::new(Default::default()),
            )
            .unwrap();

        assert!(result.history.epochs.len() <= 2);
        assert!(!result.history.epochs.is_empty());
        let first = &result.history.epochs[0];
        assert!(first.improved);
        assert!(first.valid.contains_key("dice_loss"));
        assert!(first.auc.is_some());

        assert!(dir.path().join(HISTORY_FILE).is_file());
        assert!(dir.path().join(CONFIG_FILE).is_file());
        assert!(dir.path().join("model.mpk").is_file());
        assert!(dir.path().join("model_best.mpk").is_file());
        assert_eq!(
            TrainingHistory::load(&dir.path().join(HISTORY_FILE)).unwrap(),
            result.history
        );
    }

    #[test]
    fn fits_cnn3d_until_epoch_cap() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let (archive, metadata) = archive(6, 4);
        let patients = ids(6);

        let train = VolumeDataset::new(&archive, &metadata, &patients[..4]).unwrap();
        let valid = VolumeDataset::new(&archive, &metadata, &patients[4..]).unwrap();

        let model = Cnn3dConfig::new()
            .with_n_filters(2)
            .with_n_blocks(2)
            .with_n_layers_conv(1)
            .with_dense_units(4)
            .init::<TestAutodiffBackend>(&device);

        let config = training_config()
            .with_max_epochs(1)
            .with_increase_batch(false);
        let trainer = Trainer::<TestAutodiffBackend>::new(config, dir.path(), device).unwrap();
        let result = trainer
            .fit(
                model,
                AdamConfig::new().init(),
                train,
                valid,
                VolumeBatcher::<TestAutodiffBackend>::new(Default::default()),
                VolumeBatcher::<TestBackend>::new(Default::default()),
            )
            .unwrap();

        assert_eq!(result.stop, StopReason::MaxEpochs(1));
        assert_eq!(result.history.epochs.len(), 1);
        assert_eq!(result.history.epochs[0].batch_size, 2);
        // one positive and one negative validation patient
        assert!(result.history.epochs[0].auc.is_some());
    }

    #[test]
    fn stops_when_every_training_batch_is_non_finite() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let (archive, _) = archive(3, 2);
        let patients = ids(3);

        let train = SliceDataset::new(&archive, &patients[..2], 1).unwrap();
        let valid = SliceDataset::new(&archive, &patients[2..], 1).unwrap();

        // an infinite smoothing term turns every Dice ratio into inf / inf
        let model = UNet2p5dConfig::new(train.channels())
            .with_n_filters(2)
            .with_n_layers_unet(2)
            .with_n_layers_conv(1)
            .with_loss(
                SegmentationLossConfig::new()
                    .with_kind(LossKind::DiceLoss)
                    .with_dice_smooth(f64::INFINITY),
            )
            .init::<TestAutodiffBackend>(&device);

        let trainer =
            Trainer::<TestAutodiffBackend>::new(training_config(), dir.path(), device).unwrap();
        let result = trainer.fit(
            model,
            AdamConfig::new().init(),
            train,
            valid,
            SegmentationBatcher::<TestAutodiffBackend>::new(Default::default()),
            SegmentationBatcher::<TestBackend>::new(Default::default()),
        );

        assert!(matches!(result, Err(TrainingError::EmptyEpoch(1))));
        assert!(!dir.path().join("model.mpk").exists());
        assert!(!dir.path().join(HISTORY_FILE).exists());
    }

    #[test]
    fn counts_skipped_training_batches() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let (mut archive, _) = archive(3, 2);

        // a corrupt voxel in the first slice reaches both items of the patient
        let mut voxels: Vec<f32> = (0..32).map(|v| if v % 16 < 8 { 100.0 } else { 0.0 }).collect();
        voxels[5] = f32::NAN;
        let mask = voxels.iter().map(|&v| u8::from(v > 0.0)).collect();
        archive
            .push(PatientVolume::new("corrupt", [2, 4, 4], voxels, Some(mask)).unwrap())
            .unwrap();

        let train_ids = vec!["p0".to_string(), "corrupt".to_string()];
        let train = SliceDataset::new(&archive, &train_ids, 1).unwrap();
        let valid = SliceDataset::new(&archive, &ids(3)[2..], 1).unwrap();

        // Dice has no clamp, so a NaN prediction keeps the loss NaN
        let model = UNet2p5dConfig::new(train.channels())
            .with_n_filters(2)
            .with_n_layers_unet(1)
            .with_n_layers_conv(1)
            .with_dropout(0.0)
            .with_activation(Activation::Sigmoid)
            .with_loss(SegmentationLossConfig::new().with_kind(LossKind::DiceLoss))
            .init::<TestAutodiffBackend>(&device);

        let config = training_config()
            .with_max_epochs(1)
            .with_training_batch_size(1);
        let trainer = Trainer::<TestAutodiffBackend>::new(config, dir.path(), device).unwrap();
        let result = trainer
            .fit(
                model,
                AdamConfig::new().init(),
                train,
                valid,
                SegmentationBatcher::<TestAutodiffBackend>::new(Default::default()),
                SegmentationBatcher::<TestBackend>::new(Default::default()),
            )
            .unwrap();

        let epoch = &result.history.epochs[0];
        assert_eq!(epoch.skipped_batches, 2);
        assert!(epoch.train["loss"].is_finite());
        assert!(epoch.valid["loss"].is_finite());
    }

    #[test]
    fn rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();

        let result = Trainer::<TestAutodiffBackend>::new(
            TrainingConfig::new().with_training_batch_size(0),
            dir.path(),
            Default::default(),
        );

        assert!(matches!(result, Err(TrainingError::InvalidConfig(_))));
    }
}
