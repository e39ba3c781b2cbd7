//! Optimizers and learning rate schedulers
//!
//! The trainer only talks to the [`Optimizer`] and [`Scheduler`] traits. Both
//! expose their state for checkpointing: optimizer moments as named tensors,
//! scheduler counters as a small serde struct.

pub mod adamw;
pub mod schedulers;

pub use adamw::AdamW;
pub use schedulers::IterExponentialScheduler;

use std::collections::HashMap;

use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::{LrSchedulerConfig, OptimizerConfig};
use crate::error::Result;

/// Trait for optimizers
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update to `params` using accumulated `grads`
    fn step(
        &mut self,
        params: &[(String, Var)],
        grads: &HashMap<String, Tensor>,
        learning_rate: f64,
    ) -> Result<()>;

    /// Number of updates applied so far
    fn step_count(&self) -> usize;

    /// Moment tensors and step count to persist in a checkpoint
    fn state_dict(&self) -> OptimizerState;

    /// Restore moments saved by `state_dict`
    fn load_state_dict(&mut self, state: OptimizerState) -> Result<()>;
}

/// Per-step learning-rate policy
pub trait Scheduler: Send {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Learning rate for the next optimizer step
    fn learning_rate(&self) -> f64;

    /// Advance by one optimizer step
    fn step(&mut self);

    /// Step count persisted with the trainer state
    fn state(&self) -> SchedulerState;

    /// Continue from a persisted step count
    fn load_state(&mut self, state: &SchedulerState) -> Result<()>;
}

/// Optimizer state: step counter plus named moment tensors
#[derive(Debug, Clone, Default)]
pub struct OptimizerState {
    /// Updates applied so far
    pub step_count: usize,

    /// Per-parameter buffers, keyed `<buffer>.<parameter>`
    pub tensors: HashMap<String, Tensor>,
}

/// Scheduler position stored in `trainer_state.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Scheduler type
    pub scheduler_type: String,

    /// Steps taken so far
    pub step_count: usize,

    /// Base learning rate the schedule scales
    pub base_lr: f64,
}

/// Sums gradients over the batches of one accumulation window
#[derive(Debug, Default)]
pub struct GradientAccumulator {
    grads: HashMap<String, Tensor>,
    batches: usize,
}

impl GradientAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backpropagate `loss` and add the parameter gradients to the window
    pub fn accumulate(&mut self, params: &[(String, Var)], loss: &Tensor) -> Result<()> {
        let store = loss.backward()?;
        for (name, var) in params {
            let Some(grad) = store.get(var.as_tensor()) else {
                continue;
            };
            let grad = grad.detach();
            let summed = match self.grads.remove(name) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            self.grads.insert(name.clone(), summed);
        }
        self.batches += 1;
        Ok(())
    }

    /// Batches accumulated in the current window
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Hand the summed gradients over and open a new window
    pub fn take(&mut self) -> HashMap<String, Tensor> {
        self.batches = 0;
        std::mem::take(&mut self.grads)
    }

    /// Drop a partial window
    pub fn clear(&mut self) {
        self.batches = 0;
        self.grads.clear();
    }
}

/// Create the optimizer described by the run config
pub fn create_optimizer(config: &OptimizerConfig) -> Box<dyn Optimizer> {
    Box::new(AdamW::new(
        config.beta1,
        config.beta2,
        config.eps,
        config.weight_decay,
    ))
}

/// Create the learning-rate schedule described by the run config
pub fn create_scheduler(config: &LrSchedulerConfig, base_lr: f64) -> Box<dyn Scheduler> {
    Box::new(IterExponentialScheduler::new(
        base_lr,
        config.total_iter,
        config.final_ratio,
        config.warmup_steps,
    ))
}
