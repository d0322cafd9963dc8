use anyhow::Result;
use clap::Parser;
use classifier::{AppConfig, TrainOptions, Trainer};
use std::path::PathBuf;

/// Offline batch job: trains the kidney CT-scan classifier and writes the
/// model artifact plus a JSON training report.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train the kidney CT-scan classifier on a directory of class-named image folders."
)]
struct Args {
    /// Dataset directory with one subfolder per class (Normal, Cyst, Stone, Tumor)
    #[arg(long)]
    data_dir: PathBuf,

    /// Head-only training epochs
    #[arg(long)]
    epochs: Option<i64>,

    /// Batch size for the head-only phase
    #[arg(long)]
    batch_size: Option<usize>,

    /// Fine-tune epochs (0 skips the fine-tune phase)
    #[arg(long)]
    fine_tune_epochs: Option<i64>,

    /// Optional YAML config; command-line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    let mut options = TrainOptions::from_config(&config);
    if let Some(epochs) = args.epochs {
        options.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        options.batch_size = batch_size;
    }
    if let Some(fine_tune_epochs) = args.fine_tune_epochs {
        options.fine_tune_epochs = fine_tune_epochs;
    }

    let report = Trainer::new(options).train(&args.data_dir)?;
    log::info!(
        "best validation accuracy: {:.2}%",
        report.best_val_accuracy * 100.0
    );
    println!("Model artifact written to {}", report.artifact.display());
    Ok(())
}
