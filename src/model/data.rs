use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("failed to read shard {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to decode shard {path}: {source}")]
    Decode {
        path: PathBuf,
        source: bincode::Error,
    },

    #[error("corrupt shard for lod {lod}: {reason}")]
    Corrupt { lod: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardSample {
    pub label: u32,
    /// Row-major `channels x resolution x resolution` bytes.
    pub pixels: Vec<u8>,
}

/// Every training image of one level of detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    pub resolution: usize,
    pub channels: usize,
    pub samples: Vec<ShardSample>,
}

impl Shard {
    pub fn sample_len(&self) -> usize {
        self.channels * self.resolution * self.resolution
    }

    pub fn label_count(&self) -> usize {
        let mut labels: Vec<u32> = self.samples.iter().map(|s| s.label).collect();
        labels.sort_unstable();
        labels.dedup();
        labels.len()
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.samples.shuffle(rng);
    }

    /// Checks the shard against what the generator renders at `lod`.
    pub fn validate(
        &self,
        lod: usize,
        resolution: usize,
        channels: usize,
    ) -> Result<(), ShardError> {
        let corrupt = |reason: String| Err(ShardError::Corrupt { lod, reason });

        if self.resolution != resolution || self.channels != channels {
            return corrupt(format!(
                "expected {channels}x{resolution}x{resolution} images, shard holds {}x{}x{}",
                self.channels, self.resolution, self.resolution
            ));
        }
        if self.samples.is_empty() {
            return corrupt("shard has no samples".to_string());
        }
        let expected = self.sample_len();
        if let Some((index, sample)) = self
            .samples
            .iter()
            .enumerate()
            .find(|(_, s)| s.pixels.len() != expected)
        {
            return corrupt(format!(
                "sample {index} has {} bytes, expected {expected}",
                sample.pixels.len()
            ));
        }
        Ok(())
    }
}

impl Dataset<ShardSample> for Shard {
    fn get(&self, index: usize) -> Option<ShardSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Supplies the shard of a level of detail.
pub trait ShardSource {
    fn load(&mut self, lod: usize) -> Result<Shard, ShardError>;
}

/// Shards stored as `data_fold_{fold}_lod_{lod}.bin` under one directory.
#[derive(Debug, Clone)]
pub struct ShardFiles {
    dir: PathBuf,
    fold: usize,
}

impl ShardFiles {
    pub fn new<P: AsRef<Path>>(dir: P, fold: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            fold,
        }
    }

    pub fn path(&self, lod: usize) -> PathBuf {
        self.dir
            .join(format!("data_fold_{}_lod_{}.bin", self.fold, lod))
    }
}

impl ShardSource for ShardFiles {
    fn load(&mut self, lod: usize) -> Result<Shard, ShardError> {
        let path = self.path(lod);
        let file = File::open(&path).map_err(|source| ShardError::Io {
            path: path.clone(),
            source,
        })?;
        bincode::deserialize_from(BufReader::new(file))
            .map_err(|source| ShardError::Decode { path, source })
    }
}

#[derive(Clone, Debug)]
pub struct ShardBatcher {
    resolution: usize,
    channels: usize,
}

impl ShardBatcher {
    pub fn new(resolution: usize, channels: usize) -> Self {
        Self {
            resolution,
            channels,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShardBatch<B: Backend> {
    pub images: Tensor<B, 4>, // Shape: [batch_size, channels, resolution, resolution]
}

impl<B: Backend> Batcher<B, ShardSample, ShardBatch<B>> for ShardBatcher {
    fn batch(&self, items: Vec<ShardSample>, device: &B::Device) -> ShardBatch<B> {
        let batch_size = items.len();
        let values: Vec<f32> = items
            .into_iter()
            .flat_map(|item| item.pixels)
            // Normalize to [-1, 1]
            .map(|pixel| pixel as f32 / 127.5 - 1.0)
            .collect();
        let images = Tensor::<B, 4>::from_data(
            TensorData::new(
                values,
                [batch_size, self.channels, self.resolution, self.resolution],
            )
            .convert::<B::FloatElem>(),
            device,
        );
        ShardBatch { images }
    }
}
