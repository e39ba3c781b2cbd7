//! Training infrastructure for restoration runs
//!
//! This module provides the pieces the run loop is assembled from: data
//! streams, the trainer state machine, checkpointing, metrics, and
//! optimization.
//!
//! # Main Components
//!
//! - **Data**: image datasets, fixed subsets and the prefetching loader
//! - **Trainer**: gradient accumulation, periodic detours and timed exit
//! - **Checkpoints**: atomic snapshots with a `latest` pointer
//! - **Metrics**: running means, MSE and PSNR
//! - **Optimizers**: AdamW and the iteration-exponential schedule
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use slurpp::training::{Trainer, TrainerParts, SystemClock};
//!
//! let mut trainer = Trainer::new(TrainerParts {
//!     config: &config,
//!     identity: &identity,
//!     model,
//!     dataloaders,
//!     randomness,
//!     device,
//!     tracker: tracker.as_mut(),
//!     scalars: &mut scalars,
//!     clock: Arc::new(SystemClock),
//! })?;
//! let outcome = trainer.train(None).await?;
//! ```

pub mod checkpoints;
pub mod data;
pub mod metrics;
pub mod optimizers;
pub mod trainer;

#[cfg(test)]
pub mod tests;

pub use checkpoints::{checkpoint_name, CheckpointManager, LoadedCheckpoint, TrainerState};
pub use data::{build_dataloaders, Batch, DataLoader, Dataloaders, Dataset, Sample};
pub use metrics::MetricTracker;
pub use optimizers::{
    create_optimizer, create_scheduler, Optimizer, OptimizerState, Scheduler, SchedulerState,
};
pub use trainer::{
    Clock, ExitReason, ManualClock, Phase, SystemClock, TrainOutcome, Trainer, TrainerParts,
};
