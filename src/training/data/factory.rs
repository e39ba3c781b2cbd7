//! Assembly of the four streams a run iterates over

use std::path::Path;
use std::sync::Arc;

use candle_core::Device;
use tracing::info;

use super::subsets::visualization_and_validation_indices;
use super::{DataLoader, DataLoaderBuilder, Dataset, PairedImageDataset, RealImageDataset, Subset};
use crate::config::{DataloaderConfig, RunConfig};
use crate::error::Result;
use crate::seeding::RandomnessContext;

/// Label of the train-stream shuffle seed in the randomness context
pub const TRAIN_SHUFFLE_LABEL: &str = "train-shuffle";

/// Train, validation and visualization loaders of one run
pub struct Dataloaders {
    /// Full training set, reshuffled each epoch
    pub train: DataLoader,
    /// Fixed validation subset of the training set
    pub val: DataLoader,
    /// Fixed visualization subset of the training set
    pub train_vis: DataLoader,
    /// Fixed visualization subset of the real set
    pub real_vis: DataLoader,
}

impl Dataloaders {
    /// Build the streams over already opened datasets
    pub fn from_datasets(
        train_dataset: Arc<dyn Dataset>,
        real_dataset: Arc<dyn Dataset>,
        config: &DataloaderConfig,
        device: &Device,
        train_shuffle_seed: u64,
    ) -> Result<Self> {
        let (vis_indices, val_indices) = visualization_and_validation_indices(
            train_dataset.len(),
            config.train_vis_size,
            config.val_size,
        );

        let train = DataLoaderBuilder::new(train_dataset.clone())
            .batch_size(config.max_train_batch_size)
            .shuffle(train_shuffle_seed)
            .num_workers(config.num_workers)
            .prefetch_factor(config.prefetch_factor)
            .persistent_workers(config.num_workers > 0)
            .device(device.clone())
            .build()?;

        let eval_loader = |dataset: Arc<dyn Dataset>| {
            DataLoaderBuilder::new(dataset)
                .batch_size(1)
                .num_workers(config.num_workers)
                .prefetch_factor(config.prefetch_factor)
                .device(device.clone())
                .build()
        };

        let val = eval_loader(Arc::new(Subset::new(train_dataset.clone(), val_indices)?))?;
        let train_vis = eval_loader(Arc::new(Subset::new(train_dataset, vis_indices)?))?;
        let real_vis = eval_loader(Arc::new(Subset::fixed(real_dataset, config.train_vis_size)?))?;

        info!(
            train_batches = train.num_batches(),
            val = val.dataset_size(),
            train_vis = train_vis.dataset_size(),
            real_vis = real_vis.dataset_size(),
            "Dataloaders ready"
        );
        Ok(Self {
            train,
            val,
            train_vis,
            real_vis,
        })
    }
}

/// Open the configured datasets under `data_root` and build all four streams
pub fn build_dataloaders(
    config: &RunConfig,
    data_root: &Path,
    device: &Device,
    randomness: &RandomnessContext,
) -> Result<Dataloaders> {
    let image_size = config.dataloader.image_size;
    let train: Arc<dyn Dataset> = Arc::new(PairedImageDataset::open(
        data_root.join(&config.dataset.train_dir),
        image_size,
    )?);
    let real: Arc<dyn Dataset> = Arc::new(RealImageDataset::open(
        data_root.join(&config.dataset.real_dir),
        image_size,
    )?);

    Dataloaders::from_datasets(
        train,
        real,
        &config.dataloader,
        device,
        randomness.derive_seed(TRAIN_SHUFFLE_LABEL),
    )
}
