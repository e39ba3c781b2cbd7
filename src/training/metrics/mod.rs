//! Training and evaluation metrics
//!
//! [`MetricTracker`] keeps running means of named scalars between two
//! reporting points; [`psnr`] and [`mse`] score restorations against their
//! clean targets. Images are expected in `[-1, 1]`.

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Running means of named scalars
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricTracker {
    totals: BTreeMap<String, f64>,
    counts: BTreeMap<String, usize>,
}

impl MetricTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one observation of `name`
    pub fn update(&mut self, name: &str, value: f64) {
        *self.totals.entry(name.to_string()).or_default() += value;
        *self.counts.entry(name.to_string()).or_default() += 1;
    }

    /// Mean of every metric observed since the last reset
    pub fn result(&self) -> BTreeMap<String, f64> {
        self.totals
            .iter()
            .map(|(name, total)| {
                let count = self.counts.get(name).copied().unwrap_or(1).max(1);
                (name.clone(), total / count as f64)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn reset(&mut self) {
        self.totals.clear();
        self.counts.clear();
    }
}

/// Mean squared error between two images in `[-1, 1]`, measured in `[0, 1]`
pub fn mse(prediction: &Tensor, target: &Tensor) -> Result<f64> {
    let diff = prediction.sub(target)?.affine(0.5, 0.0)?;
    let value = diff.sqr()?.mean_all()?.to_dtype(candle_core::DType::F64)?;
    Ok(value.to_scalar::<f64>()?)
}

/// Peak signal-to-noise ratio in dB; identical images score `f64::INFINITY`
pub fn psnr(prediction: &Tensor, target: &Tensor) -> Result<f64> {
    let error = mse(prediction, target)?;
    if error <= 0.0 {
        return Ok(f64::INFINITY);
    }
    Ok(10.0 * (1.0 / error).log10())
}
