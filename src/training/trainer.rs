//! Restoration trainer
//!
//! [`Trainer`] is the run's state machine. It consumes the training stream
//! batch by batch, accumulates gradients over `effective_batch_size /
//! max_train_batch_size` batches and, at every optimizer-step boundary,
//! decides in a fixed order whether to stop (`max_iter`, then the wall-clock
//! deadline) or to take a detour through checkpointing, evaluation or
//! visualization. Detours happen only at boundaries, so a persisted
//! [`TrainerState`] never carries a partial accumulation window.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor, Var};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::model::{load_parameters, parameter_tensors, DenoisingModel};
use crate::run::RunIdentity;
use crate::seeding::{RandomnessContext, SeedSequence};
use crate::tracking::{RunTracker, ScalarLogger};
use crate::training::checkpoints::{
    checkpoint_name, CheckpointManager, CheckpointPayload, TrainerState,
};
use crate::training::data::{save_image, Batch, DataLoader, Dataloaders};
use crate::training::metrics::{mse, psnr, MetricTracker};
use crate::training::optimizers::{
    create_optimizer, create_scheduler, GradientAccumulator, Optimizer, Scheduler,
};

/// Environment variable holding the batch-scheduler job id
pub const SLURM_JOB_ID_ENV: &str = "SLURM_JOB_ID";

const METRICS_FILE: &str = "metrics.json";

/// Most recent phases kept by [`Trainer::phase_history`]
pub const PHASE_HISTORY_LIMIT: usize = 64;

/// Trainer lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Init,
    Running,
    Checkpointing,
    Evaluating,
    Visualizing,
    Exiting,
    Terminated,
    Failed,
}

/// Why a run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// `max_epoch` epochs were consumed
    MaxEpoch,
    /// `max_iter` optimizer steps were taken
    MaxIter,
    /// The `exit_after` deadline passed
    Deadline,
}

/// Result of a completed [`Trainer::train`] call
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub reason: ExitReason,
    pub epoch: usize,
    pub effective_iter: usize,
    /// Snapshot written on exit
    pub checkpoint: PathBuf,
}

/// Wall-clock source used for the exit deadline
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock; each reading advances it by `tick`
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    tick: Duration,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::with_tick(start, Duration::zero())
    }

    pub fn with_tick(start: DateTime<Utc>, tick: Duration) -> Self {
        Self {
            now: Mutex::new(start),
            tick,
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let mut now = self.now.lock();
        let current = *now;
        *now += self.tick;
        current
    }
}

/// Everything a trainer is assembled from
pub struct TrainerParts<'a> {
    pub config: &'a RunConfig,
    pub identity: &'a RunIdentity,
    pub model: Box<dyn DenoisingModel>,
    pub dataloaders: Dataloaders,
    pub randomness: RandomnessContext,
    pub device: Device,
    pub tracker: &'a mut dyn RunTracker,
    pub scalars: &'a mut ScalarLogger,
    pub clock: Arc<dyn Clock>,
}

/// Training-loop state machine of one run
pub struct Trainer<'a> {
    config: &'a RunConfig,
    model: Box<dyn DenoisingModel>,
    params: Vec<(String, Var)>,
    loaders: Dataloaders,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn Scheduler>,
    accumulator: GradientAccumulator,
    accumulation_steps: usize,
    checkpoints: CheckpointManager,
    randomness: RandomnessContext,
    seeds: SeedSequence,
    state: TrainerState,
    device: Device,
    tracker: &'a mut dyn RunTracker,
    scalars: &'a mut ScalarLogger,
    clock: Arc<dyn Clock>,
    evaluation_dir: PathBuf,
    visualization_dir: PathBuf,
    train_losses: MetricTracker,
    phase: Phase,
    phase_history: Vec<Phase>,
    saved: Vec<PathBuf>,
}

impl<'a> Trainer<'a> {
    /// Assemble a trainer positioned at the start of the run
    pub fn new(parts: TrainerParts<'a>) -> Result<Self> {
        let config = parts.config;
        let accumulation_steps = config.dataloader.accumulation_steps()?;
        let params = parts.model.parameters()?;
        let optimizer = create_optimizer(&config.optimizer);
        let scheduler = create_scheduler(&config.lr_scheduler, config.optimizer.learning_rate);
        let checkpoints = CheckpointManager::new(
            parts.identity.checkpoint_dir(),
            config.trainer.keep_checkpoints,
            config.trainer.backup_period,
        )?;

        let state = TrainerState {
            epoch: 0,
            batch_in_epoch: 0,
            effective_iter: 0,
            accumulated_batches: 0,
            seed: parts.randomness.seed(),
            seed_cursor: 0,
            shuffle_seed: parts.dataloaders.train.shuffle_seed(),
            best_metric: None,
            best_iter: None,
            optimizer_steps: 0,
            scheduler: scheduler.state(),
        };

        info!(
            model = parts.model.name(),
            parameters = params.len(),
            accumulation_steps,
            "Trainer initialised"
        );
        Ok(Self {
            config,
            seeds: parts.randomness.step_seeds(),
            model: parts.model,
            params,
            loaders: parts.dataloaders,
            optimizer,
            scheduler,
            accumulator: GradientAccumulator::new(),
            accumulation_steps,
            checkpoints,
            randomness: parts.randomness,
            state,
            device: parts.device,
            tracker: parts.tracker,
            scalars: parts.scalars,
            clock: parts.clock,
            evaluation_dir: parts.identity.evaluation_dir(),
            visualization_dir: parts.identity.visualization_dir(),
            train_losses: MetricTracker::new(),
            phase: Phase::Init,
            phase_history: vec![Phase::Init],
            saved: Vec::new(),
        })
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Phases entered so far, oldest first; only the last
    /// [`PHASE_HISTORY_LIMIT`] are kept
    pub fn phase_history(&self) -> &[Phase] {
        &self.phase_history
    }

    pub fn accumulation_steps(&self) -> usize {
        self.accumulation_steps
    }

    /// Snapshots written by this trainer, in order
    pub fn saved_checkpoints(&self) -> &[PathBuf] {
        &self.saved
    }

    pub fn train_loader(&self) -> &DataLoader {
        &self.loaders.train
    }

    pub fn model(&self) -> &dyn DenoisingModel {
        self.model.as_ref()
    }

    /// Seed the next training batch will draw
    pub fn peek_batch_seed(&self) -> u64 {
        self.seeds.clone().next_u64()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn transition(&mut self, next: Phase) {
        debug!("Trainer phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        if self.phase_history.len() == PHASE_HISTORY_LIMIT {
            self.phase_history.remove(0);
        }
        self.phase_history.push(next);
    }

    /// Load a snapshot.
    ///
    /// Weights are always restored. With `load_trainer_state` the counters,
    /// seeds and optimizer moments replace the current ones; the scheduler
    /// position is only taken over with `resume_lr_scheduler`.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load_checkpoint(
        &mut self,
        path: &Path,
        load_trainer_state: bool,
        resume_lr_scheduler: bool,
    ) -> Result<()> {
        let loaded =
            CheckpointManager::load(path, &self.device, load_trainer_state, resume_lr_scheduler)?;
        load_parameters(&self.params, &loaded.weights, true)?;

        let Some(mut state) = loaded.trainer_state else {
            info!("Initialised weights from {}", loaded.path.display());
            return Ok(());
        };

        self.optimizer
            .load_state_dict(loaded.optimizer.unwrap_or_default())?;
        match loaded.scheduler {
            Some(scheduler) => self.scheduler.load_state(&scheduler)?,
            None => {
                info!("Learning-rate schedule restarts from step 0");
                state.scheduler = self.scheduler.state();
            }
        }
        if state.accumulated_batches != 0 {
            warn!(
                "Checkpoint carries {} accumulated batches, discarding them",
                state.accumulated_batches
            );
            state.accumulated_batches = 0;
        }

        self.randomness = RandomnessContext::restore(state.seed);
        self.seeds = self.randomness.step_seeds();
        self.seeds.skip_to(state.seed_cursor);
        self.loaders.train.reseed(state.shuffle_seed);
        self.accumulator.clear();
        self.train_losses.reset();
        self.state = state;

        info!(
            "Resumed at epoch {}, batch {}, iter {}",
            self.state.epoch, self.state.batch_in_epoch, self.state.effective_iter
        );
        Ok(())
    }

    /// Run until `max_epoch`, `max_iter` or the deadline `t_end`
    pub async fn train(&mut self, t_end: Option<DateTime<Utc>>) -> Result<TrainOutcome> {
        match self.run_loop(t_end).await {
            Ok(outcome) => {
                self.transition(Phase::Terminated);
                info!(
                    "Training finished ({:?}) at epoch {}, iter {}",
                    outcome.reason, outcome.epoch, outcome.effective_iter
                );
                Ok(outcome)
            }
            Err(e) => {
                self.transition(Phase::Failed);
                Err(e)
            }
        }
    }

    async fn run_loop(&mut self, t_end: Option<DateTime<Utc>>) -> Result<TrainOutcome> {
        self.transition(Phase::Running);
        if let Some(t_end) = t_end {
            info!("Training will exit at {}", t_end);
        }
        if self.state.effective_iter == 0 {
            self.record_job_id()?;
        }

        let max_epoch = self.config.trainer.max_epoch;
        while self.state.epoch < max_epoch {
            let mut stream = self
                .loaders
                .train
                .epoch(self.state.epoch, self.state.batch_in_epoch)?;
            debug!(
                "Epoch {}: {} of {} batches remaining",
                self.state.epoch,
                stream.total_batches() - stream.position(),
                stream.total_batches()
            );

            while let Some(batch) = stream.next().await {
                let batch = batch?;
                self.train_batch(&batch)?;
                self.state.batch_in_epoch += 1;

                if self.accumulator.batches() < self.accumulation_steps {
                    continue;
                }
                self.optimizer_step()?;
                if let Some(reason) = self.after_step(t_end).await? {
                    return self.exit(reason);
                }
            }

            self.state.epoch += 1;
            self.state.batch_in_epoch = 0;
            info!("Epoch {} done", self.state.epoch);
        }

        if self.accumulator.batches() > 0 {
            debug!(
                "Discarding {} batches of an incomplete accumulation window",
                self.accumulator.batches()
            );
            self.accumulator.clear();
            self.state.accumulated_batches = 0;
        }
        self.transition(Phase::Checkpointing);
        self.save_checkpoint()?;
        self.exit(ExitReason::MaxEpoch)
    }

    fn record_job_id(&mut self) -> Result<()> {
        if let Ok(job_id) = std::env::var(SLURM_JOB_ID_ENV) {
            info!("{}: {}", SLURM_JOB_ID_ENV, job_id);
            self.tracker.log_text(0, "job_id", &job_id)?;
        }
        Ok(())
    }

    fn train_batch(&mut self, batch: &Batch) -> Result<()> {
        let mut rng = StdRng::seed_from_u64(self.seeds.next_u64());
        self.state.seed_cursor = self.seeds.position();

        let loss = self.model.training_loss(batch, &mut rng)?;
        let scaled = loss.affine(1.0 / self.accumulation_steps as f64, 0.0)?;
        self.accumulator.accumulate(&self.params, &scaled)?;
        self.state.accumulated_batches = self.accumulator.batches();

        let value = scalar(&loss)?;
        if value.is_finite() {
            self.train_losses.update("loss", value);
        } else {
            warn!("Non-finite training loss {} on batch {:?}", value, batch.ids);
        }
        Ok(())
    }

    fn optimizer_step(&mut self) -> Result<()> {
        let learning_rate = self.scheduler.learning_rate();
        let grads = self.accumulator.take();
        self.optimizer.step(&self.params, &grads, learning_rate)?;
        self.scheduler.step();

        self.state.accumulated_batches = 0;
        self.state.effective_iter += 1;
        self.state.optimizer_steps = self.optimizer.step_count();
        self.state.scheduler = self.scheduler.state();

        let mut values = self.train_losses.result();
        values.insert("lr".to_string(), learning_rate);
        self.train_losses.reset();
        self.report("train", &values)?;
        debug!(
            iter = self.state.effective_iter,
            loss = values.get("loss").copied().unwrap_or(f64::NAN),
            lr = learning_rate,
            "Optimizer step"
        );
        Ok(())
    }

    /// Boundary decisions after optimizer step `effective_iter`
    async fn after_step(&mut self, t_end: Option<DateTime<Utc>>) -> Result<Option<ExitReason>> {
        let iter = self.state.effective_iter;
        let config: &'a RunConfig = self.config;
        let trainer = &config.trainer;

        if trainer.max_iter > 0 && iter >= trainer.max_iter {
            info!("Reached max_iter {}", trainer.max_iter);
            self.transition(Phase::Checkpointing);
            self.save_checkpoint()?;
            return Ok(Some(ExitReason::MaxIter));
        }

        if let Some(t_end) = t_end {
            let now = self.clock.now();
            if now >= t_end {
                info!("Time is up at {}, saving checkpoint before exit", now);
                self.transition(Phase::Checkpointing);
                self.save_checkpoint()?;
                return Ok(Some(ExitReason::Deadline));
            }
        }

        let due = |period: usize| period > 0 && iter % period == 0;
        if due(trainer.save_period) || due(trainer.backup_period) {
            self.transition(Phase::Checkpointing);
            self.save_checkpoint()?;
            self.transition(Phase::Running);
        }
        if due(trainer.validation_period) {
            self.transition(Phase::Evaluating);
            self.validate().await?;
            self.transition(Phase::Running);
        }
        if due(trainer.visualization_period) {
            self.transition(Phase::Visualizing);
            self.visualize().await?;
            self.transition(Phase::Running);
        }
        Ok(None)
    }

    fn exit(&mut self, reason: ExitReason) -> Result<TrainOutcome> {
        self.transition(Phase::Exiting);
        let checkpoint = self
            .saved
            .last()
            .cloned()
            .ok_or_else(|| Error::internal("exiting without a checkpoint"))?;
        Ok(TrainOutcome {
            reason,
            epoch: self.state.epoch,
            effective_iter: self.state.effective_iter,
            checkpoint,
        })
    }

    /// Publish a snapshot of the current step
    pub fn save_checkpoint(&mut self) -> Result<PathBuf> {
        self.state.seed_cursor = self.seeds.position();
        self.state.shuffle_seed = self.loaders.train.shuffle_seed();
        self.state.scheduler = self.scheduler.state();
        self.state.optimizer_steps = self.optimizer.step_count();

        let payload = CheckpointPayload {
            state: &self.state,
            model: parameter_tensors(&self.params),
            optimizer: self.optimizer.state_dict(),
        };
        let path = self
            .checkpoints
            .save(&checkpoint_name(self.state.effective_iter), payload)?;
        self.saved.push(path.clone());
        Ok(path)
    }

    /// Restore the validation subset and score it against the clean targets
    #[instrument(skip(self), fields(iter = self.state.effective_iter))]
    pub async fn validate(&mut self) -> Result<BTreeMap<String, f64>> {
        let steps = self.config.validation.denoising_steps;
        let mut rng = self.evaluation_rng();
        let mut metrics = MetricTracker::new();
        let mut stream = self.loaders.val.epoch(0, 0)?;

        while let Some(batch) = stream.next().await {
            let batch = batch?;
            let target = batch
                .target
                .as_ref()
                .ok_or_else(|| Error::data("validation batches need clean targets"))?;
            let restored = self.model.restore(&batch.input, steps, &mut rng)?.detach();
            metrics.update("mse", mse(&restored, target)?);
            let value = psnr(&restored, target)?;
            if value.is_finite() {
                metrics.update("psnr", value);
            }
        }

        let results = metrics.result();
        let iter = self.state.effective_iter;
        let dir = self.evaluation_dir.join(checkpoint_name(iter));
        std::fs::create_dir_all(&dir)?;
        let record = json!({
            "iter": iter,
            "epoch": self.state.epoch,
            "denoising_steps": steps,
            "metrics": results,
        });
        std::fs::write(dir.join(METRICS_FILE), serde_json::to_string_pretty(&record)?)?;
        self.report("val", &results)?;

        if let Some(&value) = results.get("psnr") {
            if self.state.best_metric.map_or(true, |best| value > best) {
                info!("New best validation psnr {:.3} at iter {}", value, iter);
                self.state.best_metric = Some(value);
                self.state.best_iter = Some(iter);
            }
        }
        info!("Validation at iter {}: {:?}", iter, results);
        Ok(results)
    }

    /// Write input | restoration [| target] panels of both visualization subsets
    #[instrument(skip(self), fields(iter = self.state.effective_iter))]
    pub async fn visualize(&mut self) -> Result<Vec<PathBuf>> {
        let steps = self.config.validation.denoising_steps;
        let iter = self.state.effective_iter;
        let root = self.visualization_dir.join(checkpoint_name(iter));
        let mut rng = self.evaluation_rng();
        let mut written = Vec::new();

        for label in ["train", "real"] {
            let mut stream = match label {
                "train" => self.loaders.train_vis.epoch(0, 0)?,
                _ => self.loaders.real_vis.epoch(0, 0)?,
            };
            while let Some(batch) = stream.next().await {
                let batch = batch?;
                let restored = self.model.restore(&batch.input, steps, &mut rng)?.detach();
                for (i, id) in batch.ids.iter().enumerate() {
                    let mut columns = vec![batch.input.get(i)?, restored.get(i)?];
                    if let Some(target) = &batch.target {
                        columns.push(target.get(i)?);
                    }
                    let panel = Tensor::cat(&columns, 2)?;
                    let path = root.join(label).join(format!("{id}.png"));
                    save_image(&panel, &path)?;
                    self.tracker
                        .log_image(iter, &format!("vis/{label}/{id}"), &path)?;
                    written.push(path);
                }
            }
        }
        info!("Wrote {} visualizations to {}", written.len(), root.display());
        Ok(written)
    }

    fn evaluation_rng(&self) -> StdRng {
        let seed = self
            .config
            .validation
            .seed
            .unwrap_or_else(|| self.randomness.derive_seed("evaluation"));
        StdRng::seed_from_u64(seed)
    }

    fn report(&mut self, prefix: &str, values: &BTreeMap<String, f64>) -> Result<()> {
        let iter = self.state.effective_iter;
        self.scalars.log_dict(iter, prefix, values)?;
        let tagged: BTreeMap<String, f64> = values
            .iter()
            .map(|(name, value)| (format!("{prefix}/{name}"), *value))
            .collect();
        self.tracker.log_scalars(iter, &tagged)
    }
}

fn scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}
