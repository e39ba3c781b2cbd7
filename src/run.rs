//! Run identity and directory lifecycle
//!
//! A fresh run resolves its config, derives a job name and claims
//! `<output_dir>/<job_name>`; claiming fails if the directory already exists.
//! A resumed run is located from its checkpoint path (the run directory is
//! two levels up) and reloads the `config.yaml` persisted there verbatim.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use ignore::WalkBuilder;
use tracing::{debug, info, instrument};

use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Persisted resolved config inside the run directory
pub const CONFIG_FILE: &str = "config.yaml";

/// Source archive written on fresh runs
pub const CODE_SNAPSHOT_FILE: &str = "code_snapshot.tar";

/// Output root when `--output_dir` is not given
pub const DEFAULT_OUTPUT_DIR: &str = "./output";

/// Environment fallback of `--base_ckpt_dir`
pub const BASE_CKPT_DIR_ENV: &str = "BASE_CKPT_DIR";

/// Environment fallback of `--base_data_dir`
pub const BASE_DATA_DIR_ENV: &str = "BASE_DATA_DIR";

/// Name and location of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdentity {
    pub job_name: String,
    pub root: PathBuf,
}

impl RunIdentity {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join("checkpoint")
    }

    pub fn tensorboard_dir(&self) -> PathBuf {
        self.root.join("tensorboard")
    }

    pub fn evaluation_dir(&self) -> PathBuf {
        self.root.join("evaluation")
    }

    pub fn visualization_dir(&self) -> PathBuf {
        self.root.join("visualization")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Create the fixed subdirectories; existing ones are kept
    pub fn create_subdirs(&self) -> Result<()> {
        for dir in [
            self.checkpoint_dir(),
            self.tensorboard_dir(),
            self.evaluation_dir(),
            self.visualization_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Job-naming options from the command line
#[derive(Debug, Clone)]
pub struct NamingOptions {
    /// Append effective batch size and start time
    pub add_datetime_prefix: bool,
    /// Prepended to the final name
    pub job_name_prefix: String,
    /// Process start time
    pub start_time: DateTime<Local>,
}

/// Job name of a fresh run
pub fn job_name(config: &RunConfig, config_path: &Path, naming: &NamingOptions) -> String {
    let base = config.job_name.clone().unwrap_or_else(|| {
        let file_name = config_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        file_name.split('.').next().unwrap_or_default().to_string()
    });

    let name = if naming.add_datetime_prefix {
        format!(
            "{}_EBS{}_{}",
            base,
            config.dataloader.effective_batch_size,
            naming.start_time.format("%m%d_%H_%M_%S")
        )
    } else {
        base
    };
    format!("{}{}", naming.job_name_prefix, name)
}

/// A run ready to be trained
#[derive(Debug, Clone)]
pub struct ResolvedRun {
    pub identity: RunIdentity,
    pub config: RunConfig,
    /// Checkpoint to resume from; `None` for fresh runs
    pub resume_from: Option<PathBuf>,
}

impl ResolvedRun {
    pub fn is_resume(&self) -> bool {
        self.resume_from.is_some()
    }
}

/// Resolve the config and claim a new run directory.
///
/// The config is fully validated before anything is created on disk.
#[instrument(skip(overrides, naming))]
pub fn resolve_fresh(
    config_path: &Path,
    overrides: &[String],
    output_dir: Option<&Path>,
    naming: &NamingOptions,
) -> Result<ResolvedRun> {
    let config = RunConfig::load(config_path, overrides)?;
    let job_name = job_name(&config, config_path, naming);
    let root = output_dir
        .unwrap_or_else(|| Path::new(DEFAULT_OUTPUT_DIR))
        .join(&job_name);

    if let Some(parent) = root.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::create_dir(&root) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(Error::RunExists(root));
        }
        Err(e) => return Err(e.into()),
    }

    let identity = RunIdentity { job_name, root };
    identity.create_subdirs()?;
    info!("Created run directory {}", identity.root.display());
    Ok(ResolvedRun {
        identity,
        config,
        resume_from: None,
    })
}

/// Locate the run a checkpoint belongs to and reload its config
#[instrument]
pub fn resolve_resume(checkpoint: &Path) -> Result<ResolvedRun> {
    let root = checkpoint
        .parent()
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            Error::config(format!(
                "cannot locate the run directory of checkpoint {}",
                checkpoint.display()
            ))
        })?
        .to_path_buf();
    let job_name = root
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| Error::config(format!("invalid run directory {}", root.display())))?;

    let identity = RunIdentity { job_name, root };
    let config_path = identity.config_path();
    if !config_path.is_file() {
        return Err(Error::config(format!(
            "resumed run has no {}",
            config_path.display()
        )));
    }
    let config = RunConfig::from_file(&config_path)?;
    identity.create_subdirs()?;
    info!("Resuming run {} from {}", identity.job_name, checkpoint.display());
    Ok(ResolvedRun {
        identity,
        config,
        resume_from: Some(checkpoint.to_path_buf()),
    })
}

/// Persist the resolved config as `<run>/config.yaml`
pub fn persist_config(identity: &RunIdentity, config: &RunConfig) -> Result<PathBuf> {
    let path = identity.config_path();
    config.to_file(&path)?;
    info!("Config saved to {}", path.display());
    Ok(path)
}

/// Archive `source_root` (honouring `.gitignore`, without `.git`) plus the
/// resolved config into `<run>/code_snapshot.tar`
#[instrument(skip(identity), fields(run = %identity.root.display()))]
pub fn write_code_snapshot(identity: &RunIdentity, source_root: &Path) -> Result<PathBuf> {
    let snapshot_path = identity.root.join(CODE_SNAPSHOT_FILE);
    let run_root = identity.root.canonicalize()?;

    let mut builder = WalkBuilder::new(source_root);
    builder
        .hidden(false)
        .follow_links(false)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != ".git");

    let mut archive = tar::Builder::new(File::create(&snapshot_path)?);
    let mut count = 0usize;
    for entry in builder.build() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if path
            .canonicalize()
            .map(|p| p.starts_with(&run_root))
            .unwrap_or(true)
        {
            continue;
        }
        let relative = path.strip_prefix(source_root).unwrap_or(path);
        archive.append_path_with_name(path, Path::new("code").join(relative))?;
        count += 1;
    }

    let config_path = identity.config_path();
    if config_path.is_file() {
        archive.append_path_with_name(&config_path, CONFIG_FILE)?;
    }
    archive.into_inner()?;
    info!("Code snapshot of {} files saved to {}", count, snapshot_path.display());
    Ok(snapshot_path)
}

/// `--base_<kind>_dir`, else the environment variable, else a configuration error
pub fn resolve_base_dir(cli_value: Option<PathBuf>, env_var: &str) -> Result<PathBuf> {
    if let Some(dir) = cli_value {
        return Ok(dir);
    }
    match std::env::var_os(env_var) {
        Some(value) if !value.is_empty() => Ok(PathBuf::from(value)),
        _ => Err(Error::config(format!(
            "no base directory given; pass it on the command line or set {env_var}"
        ))),
    }
}
