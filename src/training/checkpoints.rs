//! Checkpoint save/load
//!
//! A checkpoint is an immutable directory `checkpoint/iter_NNNNNN/`:
//!
//! - `model.safetensors`: model parameters
//! - `optimizer.safetensors`: optimizer moments (absent before the first step)
//! - `trainer_state.json`: counters, seeds and scheduler state
//! - `manifest.json`: format version, creation time and a SHA-256 per file
//!
//! Snapshots are written into a hidden staging directory and renamed into
//! place; the `latest` pointer file is then replaced atomically. A crash can
//! therefore leave a stale staging directory but never a half-written
//! snapshot or a pointer to one.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::WEIGHTS_FILE;
use crate::training::optimizers::{OptimizerState, SchedulerState};

/// Current checkpoint format version
pub const FORMAT_VERSION: u32 = 1;

/// Pointer file naming the newest published snapshot
pub const LATEST_POINTER: &str = "latest";

pub const OPTIMIZER_FILE: &str = "optimizer.safetensors";
pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
pub const MANIFEST_FILE: &str = "manifest.json";

const SNAPSHOT_PREFIX: &str = "iter_";
const STAGING_PREFIX: &str = ".staging-";

/// Trainer progress persisted with every snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Current epoch (0-based)
    pub epoch: usize,
    /// Batches of the current epoch already consumed
    pub batch_in_epoch: usize,
    /// Optimizer steps taken
    pub effective_iter: usize,
    /// Batches accumulated towards the next step; 0 at every boundary
    pub accumulated_batches: usize,
    /// Run seed
    pub seed: u64,
    /// Per-batch seeds drawn so far
    pub seed_cursor: usize,
    /// Seed of the training stream's epoch orders
    pub shuffle_seed: u64,
    /// Best validation PSNR so far
    pub best_metric: Option<f64>,
    /// Step at which `best_metric` was reached
    pub best_iter: Option<usize>,
    /// Optimizer update counter
    pub optimizer_steps: usize,
    /// Learning-rate scheduler position
    pub scheduler: SchedulerState,
}

/// Integrity record of one snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// File name to hex SHA-256
    pub files: BTreeMap<String, String>,
}

/// Everything written into one snapshot
pub struct CheckpointPayload<'a> {
    pub state: &'a TrainerState,
    pub model: HashMap<String, Tensor>,
    pub optimizer: OptimizerState,
}

/// What a load returned, depending on the requested scope
#[derive(Debug)]
pub struct LoadedCheckpoint {
    /// Snapshot directory the data came from
    pub path: PathBuf,
    /// Model parameters
    pub weights: HashMap<String, Tensor>,
    /// Counters, when trainer state was requested
    pub trainer_state: Option<TrainerState>,
    /// Optimizer moments, when trainer state was requested
    pub optimizer: Option<OptimizerState>,
    /// Scheduler position, when trainer state and scheduler resume were requested
    pub scheduler: Option<SchedulerState>,
}

/// Saves, loads and prunes the snapshots of one run
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    keep: Option<usize>,
    backup_period: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, keep: Option<usize>, backup_period: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            keep,
            backup_period,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Publish a snapshot named `name` and point `latest` at it
    #[instrument(skip(self, payload), fields(dir = %self.dir.display()))]
    pub fn save(&self, name: &str, payload: CheckpointPayload<'_>) -> Result<PathBuf> {
        let target = self.dir.join(name);
        if target.exists() {
            info!("Checkpoint {} already exists, republishing pointer", name);
            self.publish_latest(name)?;
            return Ok(target);
        }

        let staging = self.dir.join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
        fs::create_dir_all(&staging)?;
        let written = self.write_snapshot(&staging, name, payload);
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                warn!("Failed to remove staging directory {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }
        fs::rename(&staging, &target)?;
        self.publish_latest(name)?;
        info!("Saved checkpoint {}", target.display());

        self.prune()?;
        Ok(target)
    }

    fn write_snapshot(&self, dir: &Path, name: &str, payload: CheckpointPayload<'_>) -> Result<()> {
        let mut files = BTreeMap::new();

        let model_path = dir.join(WEIGHTS_FILE);
        candle_core::safetensors::save(&payload.model, &model_path)?;
        files.insert(WEIGHTS_FILE.to_string(), sha256_file(&model_path)?);

        if !payload.optimizer.tensors.is_empty() {
            let optimizer_path = dir.join(OPTIMIZER_FILE);
            candle_core::safetensors::save(&payload.optimizer.tensors, &optimizer_path)?;
            files.insert(OPTIMIZER_FILE.to_string(), sha256_file(&optimizer_path)?);
        }

        let state_path = dir.join(TRAINER_STATE_FILE);
        fs::write(&state_path, serde_json::to_string_pretty(payload.state)?)?;
        files.insert(TRAINER_STATE_FILE.to_string(), sha256_file(&state_path)?);

        let manifest = CheckpointManifest {
            version: FORMAT_VERSION,
            name: name.to_string(),
            created_at: Utc::now(),
            files,
        };
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_string_pretty(&manifest)?)?;
        Ok(())
    }

    fn publish_latest(&self, name: &str) -> Result<()> {
        let temp = self.dir.join(format!(".{LATEST_POINTER}-{}", Uuid::new_v4()));
        fs::write(&temp, name)?;
        fs::rename(&temp, self.dir.join(LATEST_POINTER))?;
        debug!("Latest checkpoint is now {}", name);
        Ok(())
    }

    /// Snapshot directory the `latest` pointer names, if any
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        let pointer = self.dir.join(LATEST_POINTER);
        if !pointer.is_file() {
            return Ok(None);
        }
        Ok(Some(resolve_snapshot(&pointer)?))
    }

    /// Published snapshots ordered by step
    pub fn snapshots(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut snapshots: Vec<(usize, PathBuf)> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                parse_step(&name).map(|step| (step, entry.path()))
            })
            .collect();
        snapshots.sort();
        Ok(snapshots)
    }

    fn is_backup(&self, step: usize) -> bool {
        self.backup_period > 0 && step % self.backup_period == 0
    }

    /// Delete the oldest regular snapshots beyond the retention limit
    fn prune(&self) -> Result<()> {
        let Some(keep) = self.keep else {
            return Ok(());
        };
        let latest = self.latest()?;
        let prunable: Vec<PathBuf> = self
            .snapshots()?
            .into_iter()
            .filter(|(step, _)| !self.is_backup(*step))
            .map(|(_, path)| path)
            .collect();

        let excess = prunable.len().saturating_sub(keep);
        for path in prunable.into_iter().take(excess) {
            if latest.as_deref() == Some(path.as_path()) {
                continue;
            }
            fs::remove_dir_all(&path)?;
            debug!("Pruned checkpoint {}", path.display());
        }
        Ok(())
    }

    /// Load a snapshot directory or a pointer file.
    ///
    /// Without `load_trainer_state` only the model weights are returned. The
    /// scheduler position is returned only when `resume_lr_scheduler` is also
    /// set.
    #[instrument(skip(device), fields(path = %path.display()))]
    pub fn load(
        path: &Path,
        device: &Device,
        load_trainer_state: bool,
        resume_lr_scheduler: bool,
    ) -> Result<LoadedCheckpoint> {
        let dir = resolve_snapshot(path)?;
        let manifest = verify_manifest(&dir)?;
        debug!("Verified checkpoint {} created at {}", manifest.name, manifest.created_at);

        let weights = candle_core::safetensors::load(dir.join(WEIGHTS_FILE), device)?;
        if !load_trainer_state {
            info!("Loaded model weights from {}", dir.display());
            return Ok(LoadedCheckpoint {
                path: dir,
                weights,
                trainer_state: None,
                optimizer: None,
                scheduler: None,
            });
        }

        let state: TrainerState =
            serde_json::from_str(&fs::read_to_string(dir.join(TRAINER_STATE_FILE))?)?;
        let tensors = if manifest.files.contains_key(OPTIMIZER_FILE) {
            candle_core::safetensors::load(dir.join(OPTIMIZER_FILE), device)?
        } else {
            HashMap::new()
        };
        let optimizer = OptimizerState {
            step_count: state.optimizer_steps,
            tensors,
        };
        let scheduler = resume_lr_scheduler.then(|| state.scheduler.clone());

        info!(
            "Loaded checkpoint {} (epoch {}, iter {})",
            dir.display(),
            state.epoch,
            state.effective_iter
        );
        Ok(LoadedCheckpoint {
            path: dir,
            weights,
            trainer_state: Some(state),
            optimizer: Some(optimizer),
            scheduler,
        })
    }
}

/// Snapshot directory name of optimizer step `step`
pub fn checkpoint_name(step: usize) -> String {
    format!("{SNAPSHOT_PREFIX}{step:06}")
}

fn parse_step(name: &str) -> Option<usize> {
    name.strip_prefix(SNAPSHOT_PREFIX)?.parse().ok()
}

/// Follow a pointer file to its snapshot; directories are returned as is
pub fn resolve_snapshot(path: &Path) -> Result<PathBuf> {
    if path.is_dir() {
        return Ok(path.to_path_buf());
    }
    if !path.is_file() {
        return Err(Error::checkpoint(format!(
            "checkpoint not found: {}",
            path.display()
        )));
    }
    let name = fs::read_to_string(path)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::checkpoint(format!("empty pointer file {}", path.display())));
    }
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let dir = parent.join(name);
    if !dir.is_dir() {
        return Err(Error::checkpoint(format!(
            "pointer {} names missing snapshot {}",
            path.display(),
            dir.display()
        )));
    }
    Ok(dir)
}

fn verify_manifest(dir: &Path) -> Result<CheckpointManifest> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let manifest: CheckpointManifest = serde_json::from_str(
        &fs::read_to_string(&manifest_path).map_err(|e| {
            Error::checkpoint(format!("cannot read {}: {e}", manifest_path.display()))
        })?,
    )?;

    if manifest.version != FORMAT_VERSION {
        return Err(Error::checkpoint(format!(
            "unsupported checkpoint format {} (expected {FORMAT_VERSION})",
            manifest.version
        )));
    }
    if !manifest.files.contains_key(WEIGHTS_FILE) {
        return Err(Error::checkpoint(format!(
            "{} lists no model weights",
            manifest_path.display()
        )));
    }
    for (file, expected) in &manifest.files {
        let actual = sha256_file(&dir.join(file))?;
        if &actual != expected {
            return Err(Error::checkpoint(format!(
                "digest mismatch for {} in {}",
                file,
                dir.display()
            )));
        }
    }
    Ok(manifest)
}

fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_names() {
        assert_eq!(checkpoint_name(42), "iter_000042");
        assert_eq!(parse_step("iter_000042"), Some(42));
        assert_eq!(parse_step("latest"), None);
        assert_eq!(parse_step(".staging-1234"), None);
    }
}
