//! Run configuration
//!
//! A run is described by one YAML document. Documents may pull in other
//! documents through a `base_config` list; bases are merged in order and the
//! including document wins. After merging, the document is deserialized into
//! the strongly typed [`RunConfig`]: unknown keys and missing required keys
//! are resolution errors, and every fallback value is listed in the `default_*`
//! functions below.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// Key listing the documents a config inherits from
pub const INCLUDE_KEY: &str = "base_config";

/// Fully resolved configuration of one training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Explicit job name; falls back to the config file stem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    /// Trainer selection and step-based schedules
    pub trainer: TrainerConfig,

    /// Batch sizing and loader parallelism
    pub dataloader: DataloaderConfig,

    /// Dataset locations, relative to the data root
    pub dataset: DatasetConfig,

    /// Pretrained model locations, relative to the checkpoint root
    pub model: ModelConfig,

    /// Optimizer hyperparameters
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Learning-rate schedule
    pub lr_scheduler: LrSchedulerConfig,

    /// Validation and visualization sampling
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Console and file logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Extra options handed verbatim to the run-tracking client
    #[serde(default)]
    pub wandb: BTreeMap<String, Value>,

    /// Checkpoint whose weights warm-start a new run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fine_tune: Option<PathBuf>,

    /// Use the dual-conditioning model
    #[serde(default)]
    pub dual: bool,
}

/// Registered trainer implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainerKind {
    /// Conditional diffusion restoration trainer
    #[serde(rename = "SlurppTrainer")]
    Slurpp,
}

/// Trainer section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainerConfig {
    /// Trainer implementation
    pub name: TrainerKind,

    /// Run seed; `None` runs unseeded with a warning
    #[serde(default)]
    pub init_seed: Option<u64>,

    /// Number of passes over the training set
    pub max_epoch: usize,

    /// Optimizer-step budget; 0 means unbounded
    pub max_iter: usize,

    /// Checkpoint every N optimizer steps; 0 disables
    pub save_period: usize,

    /// Steps whose checkpoints survive retention; 0 disables
    #[serde(default)]
    pub backup_period: usize,

    /// Validate every N optimizer steps; 0 disables
    pub validation_period: usize,

    /// Visualize every N optimizer steps; 0 disables
    pub visualization_period: usize,

    /// Keep at most N snapshots
    #[serde(default)]
    pub keep_checkpoints: Option<usize>,
}

/// Dataloader section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataloaderConfig {
    /// Batch size that fits on the device
    pub max_train_batch_size: usize,

    /// Batch size one optimizer step corresponds to
    pub effective_batch_size: usize,

    /// Prefetching workers per stream
    pub num_workers: usize,

    /// Validation subset size
    pub val_size: usize,

    /// Visualization subset size (training and real data)
    pub train_vis_size: usize,

    /// Square side length images are resized to
    #[serde(default = "default_image_size")]
    pub image_size: u32,

    /// Batches queued per worker
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
}

/// Dataset section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    /// Paired (degraded, clean) training images
    pub train_dir: PathBuf,

    /// Unpaired real underwater images
    pub real_dir: PathBuf,
}

/// Model section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Pretrained weights of the (first) denoiser
    pub pretrained_path: PathBuf,

    /// Pretrained weights of the second denoiser in dual mode
    #[serde(default)]
    pub pretrained_path2: Option<PathBuf>,

    /// Width of the denoiser's hidden layers
    #[serde(default = "default_hidden_channels")]
    pub hidden_channels: usize,

    /// Length of the diffusion noise schedule
    #[serde(default = "default_num_train_timesteps")]
    pub num_train_timesteps: usize,
}

/// Optimizer section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Base learning rate
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// First-moment decay
    #[serde(default = "default_beta1")]
    pub beta1: f64,

    /// Second-moment decay
    #[serde(default = "default_beta2")]
    pub beta2: f64,

    /// Numerical stability term
    #[serde(default = "default_eps")]
    pub eps: f64,

    /// Decoupled weight decay
    #[serde(default)]
    pub weight_decay: f64,
}

/// Learning-rate scheduler section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LrSchedulerConfig {
    /// Steps of linear warmup
    #[serde(default)]
    pub warmup_steps: usize,

    /// Step at which the decay reaches `final_ratio`
    pub total_iter: usize,

    /// Final learning rate as a fraction of the base rate
    pub final_ratio: f64,
}

/// Validation section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationConfig {
    /// Sampling steps used when restoring images
    #[serde(default = "default_denoising_steps")]
    pub denoising_steps: usize,

    /// Seed for restoration noise; defaults to the run seed
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log file name inside the run directory
    #[serde(default = "default_log_filename")]
    pub filename: String,

    /// Console verbosity (overridden by `RUST_LOG`)
    #[serde(default = "default_console_level")]
    pub console_level: LogLevel,

    /// Log file verbosity
    #[serde(default = "default_file_level")]
    pub file_level: LogLevel,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

fn default_image_size() -> u32 {
    256
}

fn default_prefetch_factor() -> usize {
    2
}

fn default_hidden_channels() -> usize {
    32
}

fn default_num_train_timesteps() -> usize {
    1000
}

fn default_learning_rate() -> f64 {
    3e-5
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_eps() -> f64 {
    1e-8
}

fn default_denoising_steps() -> usize {
    10
}

fn default_log_filename() -> String {
    "logging.log".to_string()
}

fn default_console_level() -> LogLevel {
    LogLevel::Info
}

fn default_file_level() -> LogLevel {
    LogLevel::Debug
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            denoising_steps: default_denoising_steps(),
            seed: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filename: default_log_filename(),
            console_level: default_console_level(),
            file_level: default_file_level(),
        }
    }
}

impl DataloaderConfig {
    /// Number of device batches whose gradients make up one optimizer step
    pub fn accumulation_steps(&self) -> Result<usize> {
        let device_batch = self.max_train_batch_size;
        let effective = self.effective_batch_size;

        if device_batch == 0 {
            return Err(Error::config("max_train_batch_size must be greater than 0"));
        }
        if effective < device_batch {
            return Err(Error::config(format!(
                "effective_batch_size ({effective}) must be >= max_train_batch_size ({device_batch})"
            )));
        }
        if effective % device_batch != 0 {
            return Err(Error::config(format!(
                "effective_batch_size ({effective}) must be a multiple of max_train_batch_size ({device_batch})"
            )));
        }
        Ok(effective / device_batch)
    }
}

impl RunConfig {
    /// Resolve a fresh-run config: includes, then overrides, then validation
    pub fn load<P: AsRef<Path>>(path: P, overrides: &[String]) -> Result<Self> {
        let mut document = recursive_load_config(path.as_ref())?;
        for assignment in overrides {
            apply_override(&mut document, assignment)?;
        }
        Self::from_value(document)
    }

    /// Load a previously persisted config verbatim
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "failed to read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let document: Value = serde_yaml::from_str(&content)?;
        Self::from_value(document)
    }

    /// Deserialize and validate a merged document
    pub fn from_value(document: Value) -> Result<Self> {
        let config: Self = serde_yaml::from_value(document)
            .map_err(|e| Error::config(format!("invalid run configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// The config as a generic document, for the run-tracking client
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_yaml::to_value(self)?)
    }

    /// Validate cross-field invariants
    pub fn validate(&self) -> Result<()> {
        self.dataloader.accumulation_steps()?;

        if self.dataloader.image_size == 0 {
            return Err(Error::config("image_size must be greater than 0"));
        }
        if self.dataloader.prefetch_factor == 0 {
            return Err(Error::config("prefetch_factor must be greater than 0"));
        }
        if self.trainer.max_epoch == 0 {
            return Err(Error::config("max_epoch must be greater than 0"));
        }
        if self.optimizer.learning_rate <= 0.0 {
            return Err(Error::config("learning_rate must be positive"));
        }
        if self.lr_scheduler.total_iter == 0 {
            return Err(Error::config("lr_scheduler.total_iter must be greater than 0"));
        }
        if !(self.lr_scheduler.final_ratio > 0.0 && self.lr_scheduler.final_ratio <= 1.0) {
            return Err(Error::config("lr_scheduler.final_ratio must be in (0, 1]"));
        }
        if self.validation.denoising_steps == 0 {
            return Err(Error::config("validation.denoising_steps must be greater than 0"));
        }
        if self.model.hidden_channels == 0 || self.model.num_train_timesteps == 0 {
            return Err(Error::config(
                "model.hidden_channels and model.num_train_timesteps must be greater than 0",
            ));
        }
        if self.dual && self.model.pretrained_path2.is_none() {
            return Err(Error::config("dual mode requires model.pretrained_path2"));
        }
        Ok(())
    }
}

/// Load a YAML document and merge everything it includes
pub fn recursive_load_config(path: &Path) -> Result<Value> {
    let mut stack = Vec::new();
    load_with_includes(path, &mut stack)
}

fn load_with_includes(path: &Path, stack: &mut Vec<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().map_err(|e| {
        Error::config(format!("failed to open config {}: {e}", path.display()))
    })?;
    if stack.contains(&canonical) {
        return Err(Error::config(format!(
            "config include cycle through {}",
            canonical.display()
        )));
    }

    let content = std::fs::read_to_string(&canonical)?;
    let mut document: Value = serde_yaml::from_str(&content)?;
    let mapping = document.as_mapping_mut().ok_or_else(|| {
        Error::config(format!("config {} is not a mapping", canonical.display()))
    })?;

    let includes = match mapping.remove(INCLUDE_KEY) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(single)) => vec![single],
        Some(Value::Sequence(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(Error::config(format!(
                    "{INCLUDE_KEY} entries must be paths, got {other:?}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => {
            return Err(Error::config(format!(
                "{INCLUDE_KEY} must be a path or a list of paths, got {other:?}"
            )))
        }
    };

    let parent = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
    stack.push(canonical.clone());
    let mut merged = Value::Mapping(Mapping::new());
    for include in includes {
        let base = load_with_includes(&parent.join(&include), stack)?;
        debug!("Merged base config {} into {}", include, canonical.display());
        merge_values(&mut merged, base);
    }
    stack.pop();

    merge_values(&mut merged, document);
    Ok(merged)
}

/// Deep-merge `overlay` into `base`; mappings merge, everything else replaces
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply a `dotted.key=value` override; the value is parsed as YAML
pub fn apply_override(document: &mut Value, assignment: &str) -> Result<()> {
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| Error::config(format!("override '{assignment}' is not KEY=VALUE")))?;
    let segments: Vec<&str> = key.trim().split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::config(format!("override key '{key}' is malformed")));
    }
    let value: Value = serde_yaml::from_str(raw.trim())?;

    let mut cursor = document;
    for segment in &segments[..segments.len() - 1] {
        let mapping = cursor
            .as_mapping_mut()
            .ok_or_else(|| Error::config(format!("override '{key}' crosses a non-mapping value")))?;
        cursor = mapping
            .entry(Value::String((*segment).to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
    let mapping = cursor
        .as_mapping_mut()
        .ok_or_else(|| Error::config(format!("override '{key}' crosses a non-mapping value")))?;
    let leaf = segments[segments.len() - 1].to_string();
    mapping.insert(Value::String(leaf), value);
    Ok(())
}
