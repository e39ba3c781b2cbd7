//! SLURPP - Reproducible, resumable training runs for underwater image restoration
//!
//! This crate orchestrates the training of a conditional diffusion denoiser:
//! run directories and configuration, deterministic seeding, the four data
//! streams, gradient accumulation, checkpoints and timed exits.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod run;
pub mod seeding;
pub mod tracking;
pub mod training;

// Re-exports
pub use config::RunConfig;
pub use error::{Error, Result};
pub use run::{resolve_fresh, resolve_resume, NamingOptions, ResolvedRun, RunIdentity};
pub use seeding::{generate_seed_sequence, seed_all, RandomnessContext, SeedSequence};
pub use training::{TrainOutcome, Trainer, TrainerParts};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use candle_core::Device;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

use crate::logging::LoggingHandle;
use crate::tracking::{
    init_tracker, load_tracker_id, save_tracker_id, ResumeMode, RunStatus, RunTracker,
    ScalarLogger, TrackerInit, TrackerMode,
};
use crate::training::Clock;

/// How a training process was launched
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Config of a fresh run
    pub config: Option<PathBuf>,
    /// Checkpoint of a run to resume; wins over `config`
    pub resume_run: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub no_cuda: bool,
    /// Save and exit after this many minutes
    pub exit_after: Option<u64>,
    pub no_wandb: bool,
    pub base_data_dir: PathBuf,
    pub base_ckpt_dir: PathBuf,
    /// `key.path=value` overrides of a fresh run
    pub overrides: Vec<String>,
    pub naming: NamingOptions,
    /// Tree archived into the code snapshot
    pub source_root: PathBuf,
}

/// A resolved run with its device, randomness and tracking handles
pub struct TrainingSession {
    options: LaunchOptions,
    run: ResolvedRun,
    device: Device,
    randomness: RandomnessContext,
    tracker: Box<dyn RunTracker>,
    scalars: ScalarLogger,
}

impl TrainingSession {
    /// Resolve the run directory and open everything training writes to
    #[instrument(skip_all)]
    pub fn prepare(options: LaunchOptions, logging: &LoggingHandle) -> Result<Self> {
        let run = match (&options.resume_run, &options.config) {
            (Some(checkpoint), _) => resolve_resume(checkpoint)?,
            (None, Some(config)) => {
                resolve_fresh(config, &options.overrides, options.output_dir.as_deref(), &options.naming)?
            }
            (None, None) => {
                return Err(Error::config("either a config or a run to resume is required"))
            }
        };
        logging.attach_run_log(&run.identity.root, &run.config.logging)?;
        info!("Run directory: {}", run.identity.root.display());

        if !run.is_resume() {
            run::persist_config(&run.identity, &run.config)?;
            run::write_code_snapshot(&run.identity, &options.source_root)?;
        }

        let device = select_device(options.no_cuda)?;
        info!("device = {:?}", device);
        let randomness = seed_all(run.config.trainer.init_seed, &device)?;

        let tracker = open_tracker(&run, options.no_wandb)?;
        let scalars = ScalarLogger::new(&run.identity.tensorboard_dir())?;

        Ok(Self {
            options,
            run,
            device,
            randomness,
            tracker,
            scalars,
        })
    }

    pub fn run(&self) -> &ResolvedRun {
        &self.run
    }

    /// Wall-clock time at which a timed run saves and exits.
    ///
    /// Measured from process start, so run resolution and setup count
    /// against the budget.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.options
            .exit_after
            .filter(|minutes| *minutes > 0)
            .map(|minutes| {
                self.options.naming.start_time.with_timezone(&Utc) + Duration::minutes(minutes as i64)
            })
    }

    /// Build model, data streams and trainer, and apply the fine-tune and
    /// resume loads. Failures here are setup errors, not training errors.
    #[instrument(skip_all)]
    pub fn build_trainer(&mut self, clock: Arc<dyn Clock>) -> Result<Trainer<'_>> {
        let config = &self.run.config;
        let model = model::build_model(
            &config.model,
            config.dual,
            &self.options.base_ckpt_dir,
            &self.randomness,
            &self.device,
        )?;
        let dataloaders = training::build_dataloaders(
            config,
            &self.options.base_data_dir,
            &self.device,
            &self.randomness,
        )?;

        let mut trainer = Trainer::new(TrainerParts {
            config,
            identity: &self.run.identity,
            model,
            dataloaders,
            randomness: self.randomness.clone(),
            device: self.device.clone(),
            tracker: self.tracker.as_mut(),
            scalars: &mut self.scalars,
            clock,
        })?;

        if let Some(fine_tune) = &config.fine_tune {
            info!("Fine tune from {}", fine_tune.display());
            trainer.load_checkpoint(fine_tune, false, false)?;
        }
        if let Some(checkpoint) = &self.run.resume_from {
            trainer.load_checkpoint(checkpoint, true, true)?;
        }
        Ok(trainer)
    }

    /// Report the terminal status to the tracker
    pub fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.tracker.finish(status)
    }
}

fn select_device(no_cuda: bool) -> Result<Device> {
    if no_cuda {
        return Ok(Device::Cpu);
    }
    Ok(Device::cuda_if_available(0)?)
}

fn open_tracker(run: &ResolvedRun, no_wandb: bool) -> Result<Box<dyn RunTracker>> {
    let root = &run.identity.root;
    let mut options: BTreeMap<String, serde_json::Value> = run
        .config
        .wandb
        .iter()
        .map(|(key, value)| -> Result<(String, serde_json::Value)> {
            Ok((key.clone(), serde_json::to_value(value)?))
        })
        .collect::<Result<_>>()?;
    options.insert(
        "dir".to_string(),
        serde_json::Value::String(root.display().to_string()),
    );

    let init = if run.is_resume() {
        let id = match load_tracker_id(root) {
            Ok(id) => id,
            Err(e) if no_wandb => {
                warn!("{}", e);
                return Ok(Box::new(tracking::DisabledTracker::new(None)));
            }
            Err(e) => return Err(e),
        };
        TrackerInit::Resume {
            id,
            resume: ResumeMode::Must,
            options,
        }
    } else {
        TrackerInit::Fresh {
            config: serde_json::to_value(&run.config)?,
            name: run.identity.job_name.clone(),
            mode: TrackerMode::Online,
            options,
        }
    };

    let tracker = init_tracker(root, init, !no_wandb)?;
    if !no_wandb {
        save_tracker_id(root, tracker.id())?;
    }
    Ok(tracker)
}
