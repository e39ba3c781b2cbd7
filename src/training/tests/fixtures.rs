//! Test fixtures for setting up common test scenarios

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use rand::rngs::StdRng;
use tempfile::TempDir;

use crate::config::RunConfig;
use crate::model::{gaussian, DenoisingModel};
use crate::run::RunIdentity;
use crate::seeding::RandomnessContext;
use crate::tracking::{RunStatus, RunTracker, ScalarLogger};
use crate::training::checkpoints::TrainerState;
use crate::training::data::factory::TRAIN_SHUFFLE_LABEL;
use crate::training::data::{Batch, Dataloaders, Dataset, Sample};
use crate::training::optimizers::SchedulerState;
use crate::training::{Clock, Trainer, TrainerParts};

pub const TOY_IMAGE_SIZE: usize = 4;

/// In-memory dataset of constant images
pub struct ToyDataset {
    len: usize,
    paired: bool,
    name: String,
}

impl ToyDataset {
    pub fn paired(len: usize) -> Self {
        Self {
            len,
            paired: true,
            name: "toy_train".to_string(),
        }
    }

    pub fn real(len: usize) -> Self {
        Self {
            len,
            paired: false,
            name: "toy_real".to_string(),
        }
    }
}

impl Dataset for ToyDataset {
    fn len(&self) -> usize {
        self.len
    }

    fn get(&self, index: usize) -> crate::Result<Sample> {
        let value = (index as f32 / self.len as f32) * 2.0 - 1.0;
        let shape = (3, TOY_IMAGE_SIZE, TOY_IMAGE_SIZE);
        let input = Tensor::full(value, shape, &Device::Cpu)?;
        let target = if self.paired {
            Some(Tensor::full(value * 0.5, shape, &Device::Cpu)?)
        } else {
            None
        };
        Ok(Sample {
            id: format!("sample_{index:03}"),
            input,
            target,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Affine per-pixel restorer with two scalar parameters
pub struct ToyModel {
    weight: Var,
    bias: Var,
}

impl ToyModel {
    pub fn new(weight: f32, bias: f32) -> crate::Result<Self> {
        Ok(Self {
            weight: Var::from_tensor(&Tensor::new(&[weight], &Device::Cpu)?)?,
            bias: Var::from_tensor(&Tensor::new(&[bias], &Device::Cpu)?)?,
        })
    }

    fn predict(&self, input: &Tensor) -> crate::Result<Tensor> {
        Ok(input
            .broadcast_mul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?)
    }
}

impl DenoisingModel for ToyModel {
    fn name(&self) -> &str {
        "toy"
    }

    fn parameters(&self) -> crate::Result<Vec<(String, Var)>> {
        Ok(vec![
            ("bias".to_string(), self.bias.clone()),
            ("weight".to_string(), self.weight.clone()),
        ])
    }

    fn training_loss(&self, batch: &Batch, rng: &mut StdRng) -> crate::Result<Tensor> {
        let target = batch
            .target
            .as_ref()
            .ok_or_else(|| crate::Error::data("toy batches are paired"))?;
        let noise = gaussian(batch.input.dims(), rng, batch.input.device())?.affine(0.01, 0.0)?;
        let prediction = self.predict(&batch.input.add(&noise)?)?;
        Ok(prediction.sub(target)?.sqr()?.mean_all()?)
    }

    fn restore(&self, condition: &Tensor, _steps: usize, _rng: &mut StdRng) -> crate::Result<Tensor> {
        Ok(self.predict(condition)?.clamp(-1.0f32, 1.0f32)?)
    }
}

/// Tracker keeping everything it is sent
#[derive(Debug, Default)]
pub struct RecordingTracker {
    pub scalars: Vec<(usize, BTreeMap<String, f64>)>,
    pub images: Vec<(usize, String, PathBuf)>,
    pub texts: Vec<(usize, String, String)>,
    pub status: Option<RunStatus>,
}

impl RecordingTracker {
    /// Steps at which train scalars were reported
    pub fn optimizer_steps(&self) -> Vec<usize> {
        self.scalars
            .iter()
            .filter(|(_, values)| values.contains_key("train/lr"))
            .map(|(step, _)| *step)
            .collect()
    }
}

impl RunTracker for RecordingTracker {
    fn id(&self) -> &str {
        "recording"
    }

    fn log_scalars(&mut self, step: usize, values: &BTreeMap<String, f64>) -> crate::Result<()> {
        self.scalars.push((step, values.clone()));
        Ok(())
    }

    fn log_image(&mut self, step: usize, key: &str, path: &Path) -> crate::Result<()> {
        self.images.push((step, key.to_string(), path.to_path_buf()));
        Ok(())
    }

    fn log_text(&mut self, step: usize, key: &str, value: &str) -> crate::Result<()> {
        self.texts.push((step, key.to_string(), value.to_string()));
        Ok(())
    }

    fn finish(&mut self, status: RunStatus) -> crate::Result<()> {
        self.status = Some(status);
        Ok(())
    }
}

/// A run directory with toy data, ready to build trainers in
pub struct TrainerFixture {
    pub dir: TempDir,
    pub identity: RunIdentity,
    pub config: RunConfig,
    pub tracker: RecordingTracker,
    pub scalars: ScalarLogger,
    pub train_len: usize,
    pub real_len: usize,
}

impl TrainerFixture {
    pub fn new(config: RunConfig) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let identity = RunIdentity {
            job_name: "toy_run".to_string(),
            root: dir.path().join("toy_run"),
        };
        identity.create_subdirs()?;
        let scalars = ScalarLogger::new(&identity.tensorboard_dir())?;
        Ok(Self {
            dir,
            identity,
            config,
            tracker: RecordingTracker::default(),
            scalars,
            train_len: 16,
            real_len: 4,
        })
    }

    pub fn with_train_len(mut self, train_len: usize) -> Self {
        self.train_len = train_len;
        self
    }

    pub fn dataloaders(&self, randomness: &RandomnessContext) -> Result<Dataloaders> {
        Ok(Dataloaders::from_datasets(
            Arc::new(ToyDataset::paired(self.train_len)),
            Arc::new(ToyDataset::real(self.real_len)),
            &self.config.dataloader,
            &Device::Cpu,
            randomness.derive_seed(TRAIN_SHUFFLE_LABEL),
        )?)
    }

    /// Trainer over toy data with run seed `seed`
    pub fn trainer(&mut self, seed: u64, clock: Arc<dyn Clock>) -> Result<Trainer<'_>> {
        let randomness = RandomnessContext::restore(seed);
        let dataloaders = self.dataloaders(&randomness)?;
        Ok(Trainer::new(TrainerParts {
            config: &self.config,
            identity: &self.identity,
            model: Box::new(ToyModel::new(0.5, 0.1)?),
            dataloaders,
            randomness,
            device: Device::Cpu,
            tracker: &mut self.tracker,
            scalars: &mut self.scalars,
            clock,
        })?)
    }
}

/// Trainer state at step `iter` with otherwise fixed values
pub fn trainer_state(iter: usize) -> TrainerState {
    TrainerState {
        epoch: 1,
        batch_in_epoch: 3,
        effective_iter: iter,
        accumulated_batches: 0,
        seed: 2024,
        seed_cursor: iter * 4,
        shuffle_seed: 17,
        best_metric: Some(21.5),
        best_iter: Some(iter.saturating_sub(1)),
        optimizer_steps: iter,
        scheduler: SchedulerState {
            scheduler_type: "iter_exponential".to_string(),
            step_count: iter,
            base_lr: 3e-5,
        },
    }
}
