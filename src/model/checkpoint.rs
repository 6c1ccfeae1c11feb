use anyhow::{Context, Result};
use burn::{prelude::*, record::CompactRecorder};
use std::fs;
use std::path::{Path, PathBuf};

use crate::model::constants::{GRID_COLUMNS, GRID_PADDING, RESULTS_DIR};
use crate::model::network::Networks;
use crate::utils::tile_grid;

/// Which file set a save goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointSlot {
    /// Overwritten at the end of every epoch.
    Epoch,
    /// Written once when training completes.
    Final,
}

/// Persists network parameters with Burn's `CompactRecorder` and writes sample grids.
///
/// The recorder stores weights as f16, so a reloaded network only matches the saved one
/// to half precision. Saving it again reproduces the same file.
///
/// Layout under the artifact directory:
///   mappingmodel_tmp.mpk, generatormodel_tmp.mpk, discriminatormodel_tmp.mpk
///   mapping.mpk, generator.mpk, discriminator.mpk
///   results_rec/sample_{epoch}_{batches}.png
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create artifact dir '{}'", dir.display()))?;
        Ok(Self { dir })
    }

    /// Record path without the extension the recorder appends.
    pub fn path(&self, network: &str, slot: CheckpointSlot) -> PathBuf {
        match slot {
            CheckpointSlot::Epoch => self.dir.join(format!("{network}model_tmp")),
            CheckpointSlot::Final => self.dir.join(network),
        }
    }

    pub fn save<B: Backend, M: Module<B>>(
        &self,
        module: &M,
        network: &str,
        slot: CheckpointSlot,
    ) -> Result<()> {
        let path = self.path(network, slot);
        module
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .with_context(|| format!("failed to save {network} to '{}'", path.display()))?;
        tracing::debug!("saved {} checkpoint to '{}'", network, path.display());
        Ok(())
    }

    pub fn load<B: Backend, M: Module<B>>(
        &self,
        module: M,
        network: &str,
        slot: CheckpointSlot,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.path(network, slot);
        module
            .load_file(path.clone(), &CompactRecorder::new(), device)
            .with_context(|| format!("cannot load {network} from '{}'", path.display()))
    }

    pub fn save_networks<B, M, G, D>(
        &self,
        networks: &Networks<M, G, D>,
        slot: CheckpointSlot,
    ) -> Result<()>
    where
        B: Backend,
        M: Module<B>,
        G: Module<B>,
        D: Module<B>,
    {
        self.save::<B, _>(&networks.generator, "generator", slot)?;
        self.save::<B, _>(&networks.mapping, "mapping", slot)?;
        self.save::<B, _>(&networks.discriminator, "discriminator", slot)
    }

    pub fn sample_path(&self, epoch: usize, batches: usize) -> PathBuf {
        self.dir
            .join(RESULTS_DIR)
            .join(format!("sample_{epoch}_{batches}.png"))
    }

    /// Writes the last real batch followed by the fixed-latent renders as one grid.
    pub fn save_samples<B: Backend>(
        &self,
        reals: Tensor<B, 4>,
        renders: Tensor<B, 4>,
        epoch: usize,
        batches: usize,
    ) -> Result<PathBuf> {
        let path = self.sample_path(epoch, batches);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create '{}'", parent.display()))?;
        }

        let images = Tensor::cat(vec![reals, renders], 0);
        let [count, channels, resolution, _] = images.dims();
        let data: Vec<f32> = images
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| anyhow::anyhow!("cannot read sample tensor: {e:?}"))?;

        let grid = tile_grid(&data, count, channels, resolution, GRID_COLUMNS, GRID_PADDING)
            .context("sample batch cannot be tiled")?;
        grid.save(&path)
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        Ok(path)
    }
}
