use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use burn::{
    data::{
        dataloader::{DataLoaderBuilder, batcher::Batcher},
        dataset::Dataset,
    },
    prelude::*,
    record::CompactRecorder,
};
use burn_medseg::{
    dataset::{
        PatientMetadata, PatientSplit, SegmentationBatcher, SliceDataset, VolumeArchive,
        VolumeBatcher, VolumeDataset,
    },
    imaging::save_overlay,
    model::{Cnn3dConfig, UNet2p5d, UNet2p5dConfig},
    training::{Evaluation, evaluate, trainer::BEST_CHECKPOINT_NAME},
};
use clap::{Args, ValueEnum};

use super::{CNN3D_CONFIG_FILE, MyBackend, SPLIT_FILE, UNET_CONFIG_FILE, read_json, write_json};

const ROC_FILE: &str = "roc.json";

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModelKind {
    Unet,
    Cnn3d,
}

#[derive(Args)]
pub struct EvaluateArgs {
    /// Volume archive the model was trained on.
    #[arg(short = 'd', long)]
    pub archive: PathBuf,

    #[arg(short, long, default_value = "artifacts")]
    pub artifact_dir: PathBuf,

    #[arg(short, long, value_enum)]
    pub kind: ModelKind,

    /// Checkpoint name inside the artifact directory, without extension.
    #[arg(long, default_value = BEST_CHECKPOINT_NAME)]
    pub checkpoint: String,

    /// Patient labels, required for the 3-D CNN.
    #[arg(short, long)]
    pub metadata: Option<PathBuf>,

    #[arg(short, long, default_value_t = 8)]
    pub batch_size: usize,

    /// Write prediction and ground-truth overlays of the U-Net here.
    #[arg(long)]
    pub overlay_dir: Option<PathBuf>,

    /// Number of masked slices to draw.
    #[arg(long, default_value_t = 8)]
    pub overlays: usize,
}

pub fn run(args: &EvaluateArgs) -> Result<()> {
    let split: PatientSplit = read_json(&args.artifact_dir.join(SPLIT_FILE))?;
    println!("Loading volume archive {}...", args.archive.display());
    let archive = VolumeArchive::load(&args.archive)?;

    let evaluation = match args.kind {
        ModelKind::Unet => evaluate_unet(args, &archive, &split.test)?,
        ModelKind::Cnn3d => evaluate_cnn3d(args, &archive, &split.test)?,
    };

    println!("Held-out patients: {}", split.test.len());
    for (name, value) in evaluation.metrics.means() {
        println!("{}: {:.4}", name, value);
    }
    if evaluation.skipped_batches > 0 {
        println!(
            "{} batches with a non-finite loss were skipped",
            evaluation.skipped_batches
        );
    }

    match &evaluation.roc {
        Some(roc) => {
            println!("AUC: {:.4}", roc.auc());
            let path = args.artifact_dir.join(ROC_FILE);
            write_json(&path, roc)?;
            println!("ROC curve saved to {}", path.display());
        }
        None => println!("AUC: undefined"),
    }

    Ok(())
}

fn checkpoint_path(args: &EvaluateArgs) -> PathBuf {
    args.artifact_dir.join(&args.checkpoint)
}

fn evaluate_unet(args: &EvaluateArgs, archive: &VolumeArchive, test: &[String]) -> Result<Evaluation> {
    let config = UNet2p5dConfig::load(args.artifact_dir.join(UNET_CONFIG_FILE))
        .map_err(|err| anyhow!("Failed to load U-Net config: {:?}", err))?;
    let context = config.input_channels / 2;

    let device = Default::default();
    let model = config
        .init::<MyBackend>(&device)
        .load_file(checkpoint_path(args), &CompactRecorder::new(), &device)
        .map_err(|err| anyhow!("Failed to load checkpoint {}: {:?}", args.checkpoint, err))?;

    let dataset = SliceDataset::new(archive, test, context)?;
    println!(
        "Scoring {} slices from {} patients...",
        dataset.len(),
        dataset.num_patients()
    );

    if let Some(dir) = &args.overlay_dir {
        write_overlays(&model, &dataset, dir, args.overlays, &device)?;
    }

    let loader = DataLoaderBuilder::new(SegmentationBatcher::<MyBackend>::new(device))
        .batch_size(args.batch_size)
        .build(dataset);

    Ok(evaluate::<MyBackend, _, _, 4>(&model, loader.as_ref(), None)?)
}

fn evaluate_cnn3d(
    args: &EvaluateArgs,
    archive: &VolumeArchive,
    test: &[String],
) -> Result<Evaluation> {
    let metadata_path = args
        .metadata
        .as_ref()
        .ok_or_else(|| anyhow!("--metadata is required to evaluate the 3-D CNN"))?;
    let metadata = PatientMetadata::load(metadata_path)?;

    let config = Cnn3dConfig::load(args.artifact_dir.join(CNN3D_CONFIG_FILE))
        .map_err(|err| anyhow!("Failed to load 3-D CNN config: {:?}", err))?;

    let device = Default::default();
    let model = config
        .init::<MyBackend>(&device)
        .load_file(checkpoint_path(args), &CompactRecorder::new(), &device)
        .map_err(|err| anyhow!("Failed to load checkpoint {}: {:?}", args.checkpoint, err))?;

    let dataset = VolumeDataset::new(archive, &metadata, test)?;
    println!("Scoring {} volumes...", dataset.len());

    let loader = DataLoaderBuilder::new(VolumeBatcher::<MyBackend>::new(device))
        .batch_size(args.batch_size)
        .build(dataset);

    Ok(evaluate::<MyBackend, _, _, 2>(&model, loader.as_ref(), None)?)
}

/// Save `<patient>_<slice>_pred.png` and `<patient>_<slice>_truth.png` for the
/// first `count` slices that contain a mask.
fn write_overlays(
    model: &UNet2p5d<MyBackend>,
    dataset: &SliceDataset,
    dir: &Path,
    count: usize,
    device: &<MyBackend as Backend>::Device,
) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let batcher = SegmentationBatcher::<MyBackend>::new(device.clone());

    let items = dataset
        .iter()
        .filter(|item| item.mask.iter().any(|&value| value > 0.0))
        .take(count);

    let mut written = 0;
    for item in items {
        let slice_len = item.height * item.width;
        let centre = item.channels / 2;
        let image = item.image[centre * slice_len..(centre + 1) * slice_len].to_vec();
        let name = format!("{}_{:04}", item.patient_id, item.slice);
        let (height, width) = (item.height, item.width);
        let truth = item.mask.clone();

        let batch = batcher.batch(vec![item]);
        let prediction = model
            .forward(batch.images)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| anyhow!("Failed to read prediction: {:?}", err))?;

        save_overlay(&image, &prediction, height, width, &dir.join(format!("{name}_pred.png")))?;
        save_overlay(&image, &truth, height, width, &dir.join(format!("{name}_truth.png")))?;
        written += 1;
    }

    println!("Saved {} overlays to {}", written, dir.display());
    Ok(())
}
