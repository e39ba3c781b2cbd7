//! AdamW optimizer with decoupled weight decay

use std::collections::HashMap;

use candle_core::{Tensor, Var};

use super::{Optimizer, OptimizerState};
use crate::error::{Error, Result};

const FIRST_MOMENT: &str = "exp_avg";
const SECOND_MOMENT: &str = "exp_avg_sq";

/// AdamW optimizer
pub struct AdamW {
    /// Decay of the first-moment estimate
    beta1: f64,

    /// Decay of the second-moment estimate
    beta2: f64,

    /// Added to the denominator
    epsilon: f64,

    /// Decoupled weight decay
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// First moment estimates
    momentum: HashMap<String, Tensor>,

    /// Second moment estimates
    variance: HashMap<String, Tensor>,
}

impl AdamW {
    pub fn new(beta1: f64, beta2: f64, epsilon: f64, weight_decay: f64) -> Self {
        Self {
            beta1,
            beta2,
            epsilon,
            weight_decay,
            step_count: 0,
            momentum: HashMap::new(),
            variance: HashMap::new(),
        }
    }

    fn update_parameter(
        &mut self,
        name: &str,
        var: &Var,
        grad: &Tensor,
        learning_rate: f64,
    ) -> Result<()> {
        // m_t = β₁ m_{t-1} + (1 - β₁) g_t
        let scaled_grad = grad.affine(1.0 - self.beta1, 0.0)?;
        let momentum = match self.momentum.get(name) {
            Some(m) => m.affine(self.beta1, 0.0)?.add(&scaled_grad)?,
            None => scaled_grad,
        };

        // v_t = β₂ v_{t-1} + (1 - β₂) g_t²
        let scaled_sq = grad.sqr()?.affine(1.0 - self.beta2, 0.0)?;
        let variance = match self.variance.get(name) {
            Some(v) => v.affine(self.beta2, 0.0)?.add(&scaled_sq)?,
            None => scaled_sq,
        };

        let t = self.step_count as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        let corrected_momentum = momentum.affine(1.0 / bias_correction1, 0.0)?;
        let denominator = variance
            .affine(1.0 / bias_correction2, 0.0)?
            .sqrt()?
            .affine(1.0, self.epsilon)?;
        let update = corrected_momentum.div(&denominator)?;

        // θ_t = θ_{t-1} (1 - α λ) - α m̂_t / (√v̂_t + ε)
        let decayed = var
            .as_tensor()
            .affine(1.0 - learning_rate * self.weight_decay, 0.0)?;
        let next = decayed.sub(&update.affine(learning_rate, 0.0)?)?;
        var.set(&next)?;

        self.momentum.insert(name.to_string(), momentum);
        self.variance.insert(name.to_string(), variance);
        Ok(())
    }
}

impl Optimizer for AdamW {
    fn name(&self) -> &str {
        "adamw"
    }

    fn step(
        &mut self,
        params: &[(String, Var)],
        grads: &HashMap<String, Tensor>,
        learning_rate: f64,
    ) -> Result<()> {
        self.step_count += 1;
        for (name, var) in params {
            if let Some(grad) = grads.get(name) {
                self.update_parameter(name, var, grad, learning_rate)?;
            }
        }
        Ok(())
    }

    fn step_count(&self) -> usize {
        self.step_count
    }

    fn state_dict(&self) -> OptimizerState {
        let mut tensors = HashMap::with_capacity(self.momentum.len() * 2);
        for (name, tensor) in &self.momentum {
            tensors.insert(format!("{FIRST_MOMENT}.{name}"), tensor.clone());
        }
        for (name, tensor) in &self.variance {
            tensors.insert(format!("{SECOND_MOMENT}.{name}"), tensor.clone());
        }
        OptimizerState {
            step_count: self.step_count,
            tensors,
        }
    }

    fn load_state_dict(&mut self, state: OptimizerState) -> Result<()> {
        let mut momentum = HashMap::new();
        let mut variance = HashMap::new();
        for (key, tensor) in state.tensors {
            match key.split_once('.') {
                Some((FIRST_MOMENT, name)) => {
                    momentum.insert(name.to_string(), tensor);
                }
                Some((SECOND_MOMENT, name)) => {
                    variance.insert(name.to_string(), tensor);
                }
                _ => {
                    return Err(Error::checkpoint(format!(
                        "unexpected optimizer buffer '{key}'"
                    )))
                }
            }
        }
        self.momentum = momentum;
        self.variance = variance;
        self.step_count = state.step_count;
        Ok(())
    }
}
