use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod tasks;

#[derive(Parser)]
#[command(
    name = "burn-medseg",
    about = "Medical image segmentation and classification toolkit",
    author,
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack per-patient PNG slices into a volume archive.
    Ingest(tasks::ingest::IngestArgs),
    /// Train the 2.5-D U-Net on masked patients.
    TrainUnet(tasks::train::TrainUnetArgs),
    /// Train the 3-D CNN on labelled volumes.
    TrainCnn3d(tasks::train::TrainCnn3dArgs),
    /// Score a trained model on its held-out patients.
    Evaluate(tasks::evaluate::EvaluateArgs),
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Ingest(args) => tasks::ingest::run(args),
        Commands::TrainUnet(args) => tasks::train::run_unet(args),
        Commands::TrainCnn3d(args) => tasks::train::run_cnn3d(args),
        Commands::Evaluate(args) => tasks::evaluate::run(args),
    }
}
