use std::path::PathBuf;

use anyhow::{Result, bail};
use burn_medseg::dataset::{IngestOptions, ingest_dicom_volumes, ingest_png_volumes};
use clap::{Args, ValueEnum};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SourceFormat {
    /// `<patient>/images` slices with optional `<patient>/masks`.
    Png,
    /// `<patient>/dicom` series with an optional `<patient>/mask.nii(.gz)`.
    Dicom,
}

#[derive(Args)]
pub struct IngestArgs {
    /// Folder with one sub-folder per patient.
    #[arg(short, long)]
    pub input_dir: PathBuf,

    #[arg(short, long, value_enum, default_value = "png")]
    pub format: SourceFormat,

    /// Volume archive to write.
    #[arg(short, long, default_value = "volumes.bin")]
    pub output: PathBuf,

    /// Power-of-two factor to shrink every slice by.
    #[arg(long, default_value_t = 1)]
    pub downsample: usize,
}

pub fn run(args: &IngestArgs) -> Result<()> {
    println!("Reading patients from {}...", args.input_dir.display());
    let options = IngestOptions {
        downsample: args.downsample,
    };
    let archive = match args.format {
        SourceFormat::Png => ingest_png_volumes(&args.input_dir, &options)?,
        SourceFormat::Dicom => ingest_dicom_volumes(&args.input_dir, &options)?,
    };

    if archive.is_empty() {
        bail!("No patient folder found in {}", args.input_dir.display());
    }

    let masked = archive.iter().filter(|volume| volume.has_mask()).count();
    println!(
        "Loaded {} patients ({} with segmentation masks)",
        archive.len(),
        masked
    );

    archive.save(&args.output)?;
    println!("Saved volume archive to {}", args.output.display());
    Ok(())
}
