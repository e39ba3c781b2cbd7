//! Data loading infrastructure for restoration training
//!
//! This module provides the image datasets, deterministic subsets, the
//! prefetching [`DataLoader`] and the factory assembling the four streams a
//! run iterates over (train, validation, train-visualization and
//! real-visualization).

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};

pub mod datasets;
pub mod factory;
pub mod loaders;
pub mod subsets;

pub use datasets::{load_image, save_image, PairedImageDataset, RealImageDataset};
pub use factory::{build_dataloaders, Dataloaders};
pub use loaders::{DataLoader, DataLoaderBuilder, DataLoaderConfig, EpochStream};
pub use subsets::{fixed_permutation, Subset, SUBSET_SEED};

/// Common trait for all training datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a sample by index
    fn get(&self, index: usize) -> Result<Sample>;

    /// Dataset name, used in logs
    fn name(&self) -> &str;
}

/// A single image sample, kept on the CPU until collated
#[derive(Debug, Clone)]
pub struct Sample {
    /// Unique identifier (the file stem)
    pub id: String,
    /// Degraded image, `(3, H, W)` in `[-1, 1]`
    pub input: Tensor,
    /// Clean image, when the dataset is paired
    pub target: Option<Tensor>,
}

/// A collated batch staged on the training device
#[derive(Debug, Clone)]
pub struct Batch {
    /// Sample identifiers in batch order
    pub ids: Vec<String>,
    /// `(B, 3, H, W)` degraded images
    pub input: Tensor,
    /// `(B, 3, H, W)` clean images
    pub target: Option<Tensor>,
}

impl Batch {
    /// Stack samples along a new batch dimension and move them to `device`
    pub fn collate(samples: Vec<Sample>, device: &Device) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::data("cannot collate an empty batch"));
        }

        let paired = samples[0].target.is_some();
        let mut ids = Vec::with_capacity(samples.len());
        let mut inputs = Vec::with_capacity(samples.len());
        let mut targets = Vec::with_capacity(samples.len());
        for sample in samples {
            match (paired, sample.target) {
                (true, Some(target)) => targets.push(target),
                (false, None) => {}
                _ => {
                    return Err(Error::data(format!(
                        "sample {} does not match the pairing of its batch",
                        sample.id
                    )))
                }
            }
            ids.push(sample.id);
            inputs.push(sample.input);
        }

        let input = Tensor::stack(&inputs, 0)?.to_device(device)?;
        let target = if paired {
            Some(Tensor::stack(&targets, 0)?.to_device(device)?)
        } else {
            None
        };
        Ok(Self { ids, input, target })
    }

    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
