use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use burn::{data::dataset::Dataset, optim::AdamConfig, prelude::*};
use burn_medseg::{
    dataset::{
        PatientMetadata, PatientSplit, SegmentationBatcher, SliceDataset, VolumeArchive,
        VolumeBatcher, VolumeDataset, split_patients,
    },
    model::{Activation, Cnn3dConfig, UNet2p5dConfig},
    training::{LossKind, SegmentationLossConfig, Trainer, TrainingConfig, TrainingHistory},
};
use clap::Args;

use super::{
    CNN3D_CONFIG_FILE, MyAutodiffBackend, MyBackend, SPLIT_FILE, UNET_CONFIG_FILE, write_json,
};

/// Options shared by both models.
#[derive(Args)]
pub struct CommonArgs {
    /// Volume archive written by `ingest`.
    #[arg(short = 'd', long)]
    pub archive: PathBuf,

    #[arg(short, long, default_value = "artifacts")]
    pub artifact_dir: PathBuf,

    /// Training config JSON, flags below override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Stop after this many epochs, 0 trains until early stopping.
    #[arg(short, long)]
    pub epochs: Option<usize>,

    #[arg(short, long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub validation_batch_size: Option<usize>,

    #[arg(long)]
    pub max_batch_size: Option<usize>,

    #[arg(short, long)]
    pub lr: Option<f64>,

    /// Relative improvement of the validation loss needed to count as progress.
    #[arg(long)]
    pub delta: Option<f64>,

    #[arg(long)]
    pub early_stopping_rounds: Option<usize>,

    /// Keep the batch size fixed after bad epochs.
    #[arg(long)]
    pub no_increase_batch: bool,

    #[arg(long)]
    pub decay_learning_rate: bool,

    #[arg(long)]
    pub roc_batches: Option<usize>,

    #[arg(long)]
    pub num_workers: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub train_fraction: Option<f64>,

    /// `weighted_crossentropy` or `dice_loss`.
    #[arg(long, default_value = "weighted_crossentropy")]
    pub loss: LossKind,

    #[arg(long, default_value_t = 3.0)]
    pub bce_alpha: f64,

    #[arg(long, default_value_t = 1.0)]
    pub dice_smooth: f64,

    #[arg(long, default_value_t = 0.25)]
    pub dropout: f64,

    #[arg(long, default_value_t = 3)]
    pub kernel_size: usize,

    #[arg(long, default_value_t = 2)]
    pub n_layers_conv: usize,

    #[arg(long)]
    pub batch_norm: bool,

    /// Use ReLU instead of ELU.
    #[arg(long)]
    pub relu: bool,
}

impl CommonArgs {
    fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path).map_err(|err| {
                anyhow!("Failed to load training config {}: {:?}", path.display(), err)
            })?,
            None => TrainingConfig::new(),
        };

        if let Some(epochs) = self.epochs {
            config.max_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.training_batch_size = batch_size;
        }
        if let Some(batch_size) = self.validation_batch_size {
            config.validation_batch_size = batch_size;
        }
        if let Some(batch_size) = self.max_batch_size {
            config.max_batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.learning_rate = lr;
        }
        if let Some(delta) = self.delta {
            config.delta = delta;
        }
        if let Some(rounds) = self.early_stopping_rounds {
            config.early_stopping_rounds = rounds;
        }
        if self.no_increase_batch {
            config.increase_batch = false;
        }
        if self.decay_learning_rate {
            config.decay_learning_rate = true;
        }
        if let Some(roc_batches) = self.roc_batches {
            config.roc_batches = roc_batches;
        }
        if let Some(num_workers) = self.num_workers {
            config.num_workers = num_workers;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(fraction) = self.train_fraction {
            config.train_fraction = fraction;
        }

        Ok(config)
    }

    fn loss_config(&self) -> SegmentationLossConfig {
        SegmentationLossConfig::new()
            .with_kind(self.loss)
            .with_bce_alpha(self.bce_alpha)
            .with_dice_smooth(self.dice_smooth)
    }

    fn activation(&self) -> Activation {
        if self.relu {
            Activation::Relu
        } else {
            Activation::Elu
        }
    }
}

#[derive(Args)]
pub struct TrainUnetArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Neighbouring slices stacked on each side of the predicted slice.
    #[arg(long, default_value_t = 2)]
    pub context_slices: usize,

    #[arg(long, default_value_t = 16)]
    pub n_filters: usize,

    #[arg(long, default_value_t = 3)]
    pub n_layers_unet: usize,
}

#[derive(Args)]
pub struct TrainCnn3dArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// `{ "<patient>": { "label": 0 | 1 } }`
    #[arg(short, long)]
    pub metadata: PathBuf,

    #[arg(long, default_value_t = 8)]
    pub n_filters: usize,

    #[arg(long, default_value_t = 3)]
    pub n_blocks: usize,

    #[arg(long, default_value_t = 32)]
    pub dense_units: usize,
}

struct Prepared {
    archive: VolumeArchive,
    split: PatientSplit,
    config: TrainingConfig,
}

fn prepare(common: &CommonArgs) -> Result<Prepared> {
    let config = common.training_config()?;
    config.validate()?;

    println!("Loading volume archive {}...", common.archive.display());
    let archive = VolumeArchive::load(&common.archive)?;
    println!("Loaded {} patients", archive.len());

    let split = split_patients(&archive.patient_ids(), config.train_fraction, config.seed)?;
    std::fs::create_dir_all(&common.artifact_dir)?;
    write_json(&common.artifact_dir.join(SPLIT_FILE), &split)?;

    Ok(Prepared {
        archive,
        split,
        config,
    })
}

fn report(history: &TrainingHistory, artifact_dir: &Path) {
    println!("Trained for {} epochs", history.epochs.len());
    if let Some(loss) = history.best_valid_loss() {
        println!("Best validation loss: {:.4}", loss);
    }
    if let Some(auc) = history.last().and_then(|record| record.auc) {
        println!("Last validation AUC: {:.3}", auc);
    }
    println!("Artifacts saved in {}", artifact_dir.display());
}

pub fn run_unet(args: &TrainUnetArgs) -> Result<()> {
    let common = &args.common;
    let Prepared {
        archive,
        split,
        config,
    } = prepare(common)?;

    println!("Building slice datasets...");
    let dataset_train = SliceDataset::new(&archive, &split.train, args.context_slices)?;
    let dataset_valid = SliceDataset::new(&archive, &split.test, args.context_slices)?;
    println!(
        "{} training slices from {} patients, {} validation slices from {} patients",
        dataset_train.len(),
        dataset_train.num_patients(),
        dataset_valid.len(),
        dataset_valid.num_patients()
    );

    let model_config = UNet2p5dConfig::new(dataset_train.channels())
        .with_n_filters(args.n_filters)
        .with_n_layers_unet(args.n_layers_unet)
        .with_n_layers_conv(common.n_layers_conv)
        .with_kernel_size(common.kernel_size)
        .with_dropout(common.dropout)
        .with_batch_norm(common.batch_norm)
        .with_activation(common.activation())
        .with_loss(common.loss_config());
    model_config.validate()?;
    model_config.check_input_size(dataset_train.slice_size())?;
    model_config.save(common.artifact_dir.join(UNET_CONFIG_FILE))?;

    println!("Initializing device...");
    let device = Default::default();
    let trainer = Trainer::<MyAutodiffBackend>::new(config, &common.artifact_dir, device)?;

    println!(
        "Creating 2.5-D U-Net with {} input slices and {} base filters...",
        model_config.input_channels, model_config.n_filters
    );
    let model = model_config.init::<MyAutodiffBackend>(trainer.device());

    let result = trainer.fit(
        model,
        AdamConfig::new().init(),
        dataset_train,
        dataset_valid,
        SegmentationBatcher::<MyAutodiffBackend>::new(trainer.device().clone()),
        SegmentationBatcher::<MyBackend>::new(trainer.device().clone()),
    )?;

    report(&result.history, &common.artifact_dir);
    Ok(())
}

pub fn run_cnn3d(args: &TrainCnn3dArgs) -> Result<()> {
    let common = &args.common;
    let Prepared {
        archive,
        split,
        config,
    } = prepare(common)?;

    let metadata = PatientMetadata::load(&args.metadata)?;

    println!("Building volume datasets...");
    let dataset_train = VolumeDataset::new(&archive, &metadata, &split.train)?;
    let dataset_valid = VolumeDataset::new(&archive, &metadata, &split.test)?;
    println!(
        "{} training volumes, {} validation volumes of shape {:?}",
        dataset_train.len(),
        dataset_valid.len(),
        dataset_train.shape()
    );

    let model_config = Cnn3dConfig::new()
        .with_n_filters(args.n_filters)
        .with_n_blocks(args.n_blocks)
        .with_dense_units(args.dense_units)
        .with_n_layers_conv(common.n_layers_conv)
        .with_kernel_size(common.kernel_size)
        .with_dropout(common.dropout)
        .with_batch_norm(common.batch_norm)
        .with_activation(common.activation())
        .with_loss(common.loss_config());
    model_config.validate()?;
    model_config.check_input_size(dataset_train.shape())?;
    model_config.save(common.artifact_dir.join(CNN3D_CONFIG_FILE))?;

    println!("Initializing device...");
    let device = Default::default();
    let trainer = Trainer::<MyAutodiffBackend>::new(config, &common.artifact_dir, device)?;

    println!(
        "Creating 3-D CNN with {} blocks and {} base filters...",
        model_config.n_blocks, model_config.n_filters
    );
    let model = model_config.init::<MyAutodiffBackend>(trainer.device());

    let result = trainer.fit(
        model,
        AdamConfig::new().init(),
        dataset_train,
        dataset_valid,
        VolumeBatcher::<MyAutodiffBackend>::new(trainer.device().clone()),
        VolumeBatcher::<MyBackend>::new(trainer.device().clone()),
    )?;

    report(&result.history, &common.artifact_dir);
    Ok(())
}
