//! Learning rate schedules

use super::{Scheduler, SchedulerState};
use crate::error::{Error, Result};

/// Linear warmup followed by exponential decay to `final_ratio`.
///
/// The multiplier at step `n` is `n / warmup_steps` during warmup,
/// `final_ratio ^ ((n - warmup_steps) / total_iter)` afterwards, and
/// `final_ratio` once `n >= total_iter`.
#[derive(Debug, Clone)]
pub struct IterExponentialScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Step at which the decay reaches its final ratio
    total_iter: usize,

    /// Final multiplier
    final_ratio: f64,

    /// Warmup steps
    warmup_steps: usize,

    /// Current step
    current_step: usize,
}

impl IterExponentialScheduler {
    pub fn new(base_lr: f64, total_iter: usize, final_ratio: f64, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            total_iter,
            final_ratio,
            warmup_steps,
            current_step: 0,
        }
    }

    /// Multiplier applied to the base rate at `step`
    pub fn factor(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            step as f64 / self.warmup_steps as f64
        } else if step >= self.total_iter {
            self.final_ratio
        } else {
            let progress = (step - self.warmup_steps) as f64 / self.total_iter as f64;
            (progress * self.final_ratio.ln()).exp()
        }
    }
}

impl Scheduler for IterExponentialScheduler {
    fn name(&self) -> &str {
        "iter_exponential"
    }

    fn learning_rate(&self) -> f64 {
        self.base_lr * self.factor(self.current_step)
    }

    fn step(&mut self) {
        self.current_step += 1;
    }

    fn state(&self) -> SchedulerState {
        SchedulerState {
            scheduler_type: self.name().to_string(),
            step_count: self.current_step,
            base_lr: self.base_lr,
        }
    }

    fn load_state(&mut self, state: &SchedulerState) -> Result<()> {
        if state.scheduler_type != self.name() {
            return Err(Error::checkpoint(format!(
                "scheduler state is for '{}', expected '{}'",
                state.scheduler_type,
                self.name()
            )));
        }
        self.current_step = state.step_count;
        self.base_lr = state.base_lr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_warmup_then_decay() {
        let scheduler = IterExponentialScheduler::new(1.0, 100, 0.01, 10);
        assert_relative_eq!(scheduler.factor(0), 0.0);
        assert_relative_eq!(scheduler.factor(5), 0.5);
        assert_relative_eq!(scheduler.factor(10), 1.0);
        assert!(scheduler.factor(50) < 1.0);
        assert_relative_eq!(scheduler.factor(100), 0.01);
        assert_relative_eq!(scheduler.factor(500), 0.01);
    }

    #[test]
    fn test_decay_without_warmup() {
        let scheduler = IterExponentialScheduler::new(2.0, 100, 0.01, 0);
        assert_relative_eq!(scheduler.learning_rate(), 2.0);
        assert_relative_eq!(scheduler.factor(50), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_state_round_trip_keeps_position() {
        let mut scheduler = IterExponentialScheduler::new(1e-4, 1000, 0.1, 20);
        for _ in 0..37 {
            scheduler.step();
        }
        let state = scheduler.state();

        let mut restored = IterExponentialScheduler::new(1e-4, 1000, 0.1, 20);
        restored.load_state(&state).unwrap();
        assert_relative_eq!(restored.learning_rate(), scheduler.learning_rate());

        let mut wrong = state;
        wrong.scheduler_type = "cosine".to_string();
        assert!(restored.load_state(&wrong).is_err());
    }
}
