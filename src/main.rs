mod model;
mod utils;

use anyhow::{Context, Result};
use burn::{backend::Autodiff, config::Config};
use clap::Parser;
use model::training::TrainingConfig;
use std::path::Path;
use tracing_subscriber::EnvFilter;

const ARTIFACT_DIR: &str = "artifacts";
const CONFIG_FILE: &str = "training_config.json";

/// Progressive-resolution style GAN training.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Split every forward pass across two replicas.
    #[arg(long)]
    parallel: bool,
}

fn load_config(cli: &Cli) -> Result<TrainingConfig> {
    let path = Path::new(CONFIG_FILE);
    let mut config = if path.exists() {
        tracing::info!("loading '{}'", path.display());
        TrainingConfig::load(path).with_context(|| format!("cannot parse '{}'", path.display()))?
    } else {
        TrainingConfig::progressive()
    };
    if cli.parallel {
        config.replicas = config.replicas.max(2);
    }
    Ok(config)
}

#[cfg(feature = "cuda")]
fn launch(config: TrainingConfig) -> Result<()> {
    type MyBackend = burn::backend::Cuda<f32, i32>;
    type MyAutodiffBackend = Autodiff<MyBackend>;

    let device = burn::backend::cuda::CudaDevice::default();
    model::training::train::<MyAutodiffBackend>(Path::new(ARTIFACT_DIR), config, device)?;
    Ok(())
}

#[cfg(not(feature = "cuda"))]
fn launch(config: TrainingConfig) -> Result<()> {
    type MyBackend = burn::backend::NdArray<f32>;
    type MyAutodiffBackend = Autodiff<MyBackend>;

    let device = burn::backend::ndarray::NdArrayDevice::default();
    model::training::train::<MyAutodiffBackend>(Path::new(ARTIFACT_DIR), config, device)?;
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("progressive_gan=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    launch(config)
}
