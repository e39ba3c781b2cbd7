//! Conditional diffusion denoisers
//!
//! The trainer drives a model only through [`DenoisingModel`]: a training
//! loss for a batch and a sampler that restores degraded images. The concrete
//! [`ConditionalDenoiser`] is a small convolutional noise predictor conditioned
//! on the degraded image; [`DualConditionDenoiser`] averages the predictions of
//! two of them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::seeding::RandomnessContext;
use crate::training::data::Batch;

/// File name of model weights inside a checkpoint directory
pub const WEIGHTS_FILE: &str = "model.safetensors";

const IMAGE_CHANNELS: usize = 3;
const BETA_START: f64 = 1e-4;
const BETA_END: f64 = 0.02;

/// A trainable conditional restoration model
pub trait DenoisingModel: Send {
    /// Model name, used in logs
    fn name(&self) -> &str;

    /// Trainable parameters, sorted by name
    fn parameters(&self) -> Result<Vec<(String, Var)>>;

    /// Noise-prediction loss of one batch
    fn training_loss(&self, batch: &Batch, rng: &mut StdRng) -> Result<Tensor>;

    /// Restore `condition` (`(B, 3, H, W)` in `[-1, 1]`) in `steps` sampling steps
    fn restore(&self, condition: &Tensor, steps: usize, rng: &mut StdRng) -> Result<Tensor>;
}

/// Linear-beta DDPM noise schedule
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    pub fn linear(num_train_timesteps: usize) -> Self {
        let denominator = num_train_timesteps.saturating_sub(1).max(1) as f64;
        let mut product = 1.0;
        let alphas_cumprod = (0..num_train_timesteps)
            .map(|t| {
                let beta = BETA_START + (BETA_END - BETA_START) * t as f64 / denominator;
                product *= 1.0 - beta;
                product
            })
            .collect();
        Self { alphas_cumprod }
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    /// Cumulative signal fraction at timestep `t`
    pub fn alpha_bar(&self, t: usize) -> f64 {
        self.alphas_cumprod[t.min(self.alphas_cumprod.len() - 1)]
    }

    /// `steps` evenly spaced timesteps from the noisiest down to 0
    pub fn sampling_timesteps(&self, steps: usize) -> Vec<usize> {
        let last = self.num_train_timesteps() - 1;
        let steps = steps.clamp(1, self.num_train_timesteps());
        if steps == 1 {
            return vec![last];
        }
        (0..steps)
            .map(|i| last - (i * last) / (steps - 1))
            .collect()
    }

    /// Noise-prediction MSE for clean images `target` conditioned on `condition`
    fn training_loss<F>(
        &self,
        predict: F,
        condition: &Tensor,
        target: &Tensor,
        rng: &mut StdRng,
    ) -> Result<Tensor>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        let (batch, _, height, width) = target.dims4()?;
        let device = target.device();
        let timesteps: Vec<usize> = (0..batch)
            .map(|_| rng.random_range(0..self.num_train_timesteps()))
            .collect();

        let signal: Vec<f32> = timesteps
            .iter()
            .map(|&t| self.alpha_bar(t).sqrt() as f32)
            .collect();
        let noise_level: Vec<f32> = timesteps
            .iter()
            .map(|&t| (1.0 - self.alpha_bar(t)).sqrt() as f32)
            .collect();
        let signal = Tensor::from_vec(signal, (batch, 1, 1, 1), device)?;
        let noise_level = Tensor::from_vec(noise_level, (batch, 1, 1, 1), device)?;

        let noise = gaussian(target.dims(), rng, device)?;
        let noisy = target
            .broadcast_mul(&signal)?
            .add(&noise.broadcast_mul(&noise_level)?)?;

        let input = self.model_input(condition, &noisy, &timesteps, height, width)?;
        let predicted = predict(&input)?;
        Ok(predicted.sub(&noise)?.sqr()?.mean_all()?)
    }

    /// Deterministic DDIM sampling from pure noise
    fn restore<F>(
        &self,
        predict: F,
        condition: &Tensor,
        steps: usize,
        rng: &mut StdRng,
    ) -> Result<Tensor>
    where
        F: Fn(&Tensor) -> Result<Tensor>,
    {
        let (batch, _, height, width) = condition.dims4()?;
        let device = condition.device();
        let timesteps = self.sampling_timesteps(steps);

        let mut sample = gaussian(&[batch, IMAGE_CHANNELS, height, width], rng, device)?;
        let mut denoised = sample.clone();
        for (i, &t) in timesteps.iter().enumerate() {
            let alpha_bar = self.alpha_bar(t);
            let alpha_bar_prev = timesteps.get(i + 1).map_or(1.0, |&p| self.alpha_bar(p));

            let input = self.model_input(condition, &sample, &vec![t; batch], height, width)?;
            let eps = predict(&input)?;
            denoised = sample
                .sub(&eps.affine((1.0 - alpha_bar).sqrt(), 0.0)?)?
                .affine(1.0 / alpha_bar.sqrt(), 0.0)?
                .clamp(-1.0f32, 1.0f32)?;
            sample = denoised
                .affine(alpha_bar_prev.sqrt(), 0.0)?
                .add(&eps.affine((1.0 - alpha_bar_prev).sqrt(), 0.0)?)?;
        }
        Ok(denoised)
    }

    /// Concatenate condition, noisy image and a timestep plane along channels
    fn model_input(
        &self,
        condition: &Tensor,
        noisy: &Tensor,
        timesteps: &[usize],
        height: usize,
        width: usize,
    ) -> Result<Tensor> {
        let scale = self.num_train_timesteps() as f32;
        let levels: Vec<f32> = timesteps.iter().map(|&t| t as f32 / scale).collect();
        let plane = Tensor::from_vec(levels, (timesteps.len(), 1, 1, 1), noisy.device())?
            .broadcast_as((timesteps.len(), 1, height, width))?
            .contiguous()?;
        Ok(Tensor::cat(&[condition, noisy, &plane], 1)?)
    }
}

/// Convolutional noise predictor conditioned on the degraded image
pub struct ConditionalDenoiser {
    name: String,
    var_map: VarMap,
    conv_in: Conv2d,
    conv_mid: Conv2d,
    conv_out: Conv2d,
    schedule: NoiseSchedule,
}

impl ConditionalDenoiser {
    /// Create a denoiser with weights drawn from `rng`
    pub fn new(
        hidden_channels: usize,
        num_train_timesteps: usize,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let in_channels = 2 * IMAGE_CHANNELS + 1;
        let layers = [
            ("conv_in", in_channels, hidden_channels),
            ("conv_mid", hidden_channels, hidden_channels),
            ("conv_out", hidden_channels, IMAGE_CHANNELS),
        ];

        // Parameters are created up front so their values come from `rng`;
        // the builder below then finds them in the map.
        let var_map = VarMap::new();
        {
            let mut data = var_map
                .data()
                .lock()
                .map_err(|_| Error::internal("model parameter map is poisoned"))?;
            for (prefix, fan_in, fan_out) in layers {
                let bound = 1.0 / ((fan_in * 9) as f64).sqrt();
                let weight = uniform(&[fan_out, fan_in, 3, 3], bound, rng, device)?;
                let bias = uniform(&[fan_out], bound, rng, device)?;
                data.insert(format!("{prefix}.weight"), Var::from_tensor(&weight)?);
                data.insert(format!("{prefix}.bias"), Var::from_tensor(&bias)?);
            }
        }

        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        let conv_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv_in = candle_nn::conv2d(in_channels, hidden_channels, 3, conv_config, vb.pp("conv_in"))?;
        let conv_mid =
            candle_nn::conv2d(hidden_channels, hidden_channels, 3, conv_config, vb.pp("conv_mid"))?;
        let conv_out =
            candle_nn::conv2d(hidden_channels, IMAGE_CHANNELS, 3, conv_config, vb.pp("conv_out"))?;

        Ok(Self {
            name: "conditional_denoiser".to_string(),
            var_map,
            conv_in,
            conv_mid,
            conv_out,
            schedule: NoiseSchedule::linear(num_train_timesteps),
        })
    }

    fn predict_noise(&self, input: &Tensor) -> Result<Tensor> {
        let hidden = self.conv_in.forward(input)?.silu()?;
        let hidden = self.conv_mid.forward(&hidden)?.silu()?;
        Ok(self.conv_out.forward(&hidden)?)
    }

    /// Overwrite the weights with those stored at `path`
    pub fn load_pretrained(&self, path: &Path, device: &Device) -> Result<()> {
        let file = weights_file(path);
        if !file.is_file() {
            return Err(Error::config(format!(
                "pretrained weights not found: {}",
                file.display()
            )));
        }
        let tensors = candle_core::safetensors::load(&file, device)?;
        let loaded = load_parameters(&self.parameters()?, &tensors, true)?;
        info!("Loaded {} pretrained tensors from {}", loaded, file.display());
        Ok(())
    }
}

impl DenoisingModel for ConditionalDenoiser {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::internal("model parameter map is poisoned"))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    fn training_loss(&self, batch: &Batch, rng: &mut StdRng) -> Result<Tensor> {
        let target = batch
            .target
            .as_ref()
            .ok_or_else(|| Error::data("training batches need clean targets"))?;
        self.schedule
            .training_loss(|x| self.predict_noise(x), &batch.input, target, rng)
    }

    fn restore(&self, condition: &Tensor, steps: usize, rng: &mut StdRng) -> Result<Tensor> {
        self.schedule
            .restore(|x| self.predict_noise(x), condition, steps, rng)
    }
}

/// Two conditional denoisers whose noise predictions are averaged
pub struct DualConditionDenoiser {
    first: ConditionalDenoiser,
    second: ConditionalDenoiser,
}

impl DualConditionDenoiser {
    const FIRST_PREFIX: &'static str = "unet1.";
    const SECOND_PREFIX: &'static str = "unet2.";

    pub fn new(first: ConditionalDenoiser, second: ConditionalDenoiser) -> Self {
        Self { first, second }
    }

    fn predict_noise(&self, input: &Tensor) -> Result<Tensor> {
        let a = self.first.predict_noise(input)?;
        let b = self.second.predict_noise(input)?;
        Ok(a.add(&b)?.affine(0.5, 0.0)?)
    }
}

impl DenoisingModel for DualConditionDenoiser {
    fn name(&self) -> &str {
        "dual_condition_denoiser"
    }

    fn parameters(&self) -> Result<Vec<(String, Var)>> {
        let mut params = Vec::new();
        for (prefix, model) in [
            (Self::FIRST_PREFIX, &self.first),
            (Self::SECOND_PREFIX, &self.second),
        ] {
            params.extend(
                model
                    .parameters()?
                    .into_iter()
                    .map(|(name, var)| (format!("{prefix}{name}"), var)),
            );
        }
        Ok(params)
    }

    fn training_loss(&self, batch: &Batch, rng: &mut StdRng) -> Result<Tensor> {
        let target = batch
            .target
            .as_ref()
            .ok_or_else(|| Error::data("training batches need clean targets"))?;
        self.first
            .schedule
            .training_loss(|x| self.predict_noise(x), &batch.input, target, rng)
    }

    fn restore(&self, condition: &Tensor, steps: usize, rng: &mut StdRng) -> Result<Tensor> {
        self.first
            .schedule
            .restore(|x| self.predict_noise(x), condition, steps, rng)
    }
}

/// Build the configured model and load its pretrained weights
pub fn build_model(
    config: &ModelConfig,
    dual: bool,
    base_ckpt_dir: &Path,
    randomness: &RandomnessContext,
    device: &Device,
) -> Result<Box<dyn DenoisingModel>> {
    let create = |label: &str| {
        ConditionalDenoiser::new(
            config.hidden_channels,
            config.num_train_timesteps,
            device,
            &mut randomness.fork(label),
        )
    };

    let first = create("model-init")?;
    first.load_pretrained(&base_ckpt_dir.join(&config.pretrained_path), device)?;
    if !dual {
        return Ok(Box::new(first));
    }

    let second_path = config
        .pretrained_path2
        .as_ref()
        .ok_or_else(|| Error::config("dual mode requires model.pretrained_path2"))?;
    let second = create("model-init-2")?;
    second.load_pretrained(&base_ckpt_dir.join(second_path), device)?;
    info!("Using dual-condition model");
    Ok(Box::new(DualConditionDenoiser::new(first, second)))
}

/// Resolve a weights path that may name a checkpoint directory
pub fn weights_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(WEIGHTS_FILE)
    } else {
        path.to_path_buf()
    }
}

/// Current parameter values keyed by name
pub fn parameter_tensors(params: &[(String, Var)]) -> HashMap<String, Tensor> {
    params
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect()
}

/// Copy `tensors` into `params`; returns the number of parameters written.
///
/// With `strict`, every parameter must be present and nothing is written
/// otherwise. Shape mismatches are always an error.
pub fn load_parameters(
    params: &[(String, Var)],
    tensors: &HashMap<String, Tensor>,
    strict: bool,
) -> Result<usize> {
    if strict {
        if let Some((name, _)) = params.iter().find(|(name, _)| !tensors.contains_key(name)) {
            return Err(Error::checkpoint(format!("missing parameter '{name}'")));
        }
    }

    let mut loaded = 0;
    for (name, var) in params {
        let Some(tensor) = tensors.get(name) else {
            warn!("No stored value for parameter {}, keeping initialisation", name);
            continue;
        };
        if tensor.dims() != var.dims() {
            return Err(Error::checkpoint(format!(
                "shape mismatch for '{name}': stored {:?}, model {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
        var.set(&tensor.to_dtype(var.dtype())?.to_device(var.device())?)?;
        loaded += 1;
    }
    debug!("Loaded {} of {} parameters", loaded, params.len());
    Ok(loaded)
}

/// Standard normal tensor drawn from `rng`
pub fn gaussian(shape: &[usize], rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let count = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

fn uniform(shape: &[usize], bound: f64, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let count = shape.iter().product();
    let bound = bound as f32;
    let values: Vec<f32> = (0..count).map(|_| rng.random_range(-bound..bound)).collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}
