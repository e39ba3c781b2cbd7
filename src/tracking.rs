//! Run tracking
//!
//! Two one-way sinks receive training telemetry:
//!
//! - a [`RunTracker`], the experiment-tracking run. [`FileTracker`] keeps it
//!   under `<run>/wandb/run-<id>/` (`run.json` plus a `history.jsonl` of
//!   logged values) and [`DisabledTracker`] drops everything.
//! - a [`ScalarLogger`], the local dashboard stream in `<run>/tensorboard/`.
//!
//! The tracker id is persisted to `<run>/WANDB_ID` so a resumed run can
//! reattach to the same tracking run.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// File holding the tracker id inside the run directory
pub const TRACKER_ID_FILE: &str = "WANDB_ID";

/// Directory holding tracker runs inside the run directory
pub const TRACKER_DIR: &str = "wandb";

const RUN_FILE: &str = "run.json";
const HISTORY_FILE: &str = "history.jsonl";
const SCALARS_FILE: &str = "scalars.jsonl";

/// Tracking mode of a fresh run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerMode {
    Online,
    Offline,
}

/// Resume policy of a resumed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// The run must already exist
    Must,
    /// Create the run if it does not exist
    Allow,
}

/// Terminal status reported when a run ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
}

/// How the tracking run is opened
#[derive(Debug, Clone)]
pub enum TrackerInit {
    Fresh {
        config: serde_json::Value,
        name: String,
        mode: TrackerMode,
        options: BTreeMap<String, serde_json::Value>,
    },
    Resume {
        id: String,
        resume: ResumeMode,
        options: BTreeMap<String, serde_json::Value>,
    },
}

/// Experiment-tracking run
pub trait RunTracker: Send {
    /// Run id, persisted for resumes
    fn id(&self) -> &str;

    /// Record scalar values at `step`
    fn log_scalars(&mut self, step: usize, values: &BTreeMap<String, f64>) -> Result<()>;

    /// Record an image file at `step`
    fn log_image(&mut self, step: usize, key: &str, path: &Path) -> Result<()>;

    /// Record a text value at `step`
    fn log_text(&mut self, step: usize, key: &str, value: &str) -> Result<()>;

    /// Mark the run finished or failed
    fn finish(&mut self, status: RunStatus) -> Result<()>;
}

/// Tracker used with `--no_wandb`
#[derive(Debug, Clone)]
pub struct DisabledTracker {
    id: String,
}

impl DisabledTracker {
    pub fn new(id: Option<String>) -> Self {
        Self {
            id: id.unwrap_or_else(new_run_id),
        }
    }
}

impl RunTracker for DisabledTracker {
    fn id(&self) -> &str {
        &self.id
    }

    fn log_scalars(&mut self, _step: usize, _values: &BTreeMap<String, f64>) -> Result<()> {
        Ok(())
    }

    fn log_image(&mut self, _step: usize, _key: &str, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn log_text(&mut self, _step: usize, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    fn finish(&mut self, _status: RunStatus) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRecord {
    id: String,
    name: String,
    mode: TrackerMode,
    status: RunStatus,
    created_at: DateTime<Utc>,
    #[serde(default)]
    resumed_at: Vec<DateTime<Utc>>,
    #[serde(default)]
    options: BTreeMap<String, serde_json::Value>,
    config: serde_json::Value,
}

/// Tracking run stored on the local filesystem
pub struct FileTracker {
    dir: PathBuf,
    record: RunRecord,
    history: BufWriter<File>,
}

impl FileTracker {
    /// Open a tracking run below `tracker_root`
    pub fn init(tracker_root: &Path, init: TrackerInit) -> Result<Self> {
        let record = match init {
            TrackerInit::Fresh {
                config,
                name,
                mode,
                options,
            } => {
                let record = RunRecord {
                    id: new_run_id(),
                    name,
                    mode,
                    status: RunStatus::Running,
                    created_at: Utc::now(),
                    resumed_at: Vec::new(),
                    options,
                    config,
                };
                fs::create_dir_all(run_dir(tracker_root, &record.id))?;
                record
            }
            TrackerInit::Resume {
                id,
                resume,
                options,
            } => {
                let dir = run_dir(tracker_root, &id);
                let run_file = dir.join(RUN_FILE);
                if run_file.is_file() {
                    let mut record: RunRecord =
                        serde_json::from_str(&fs::read_to_string(&run_file)?)?;
                    record.status = RunStatus::Running;
                    record.resumed_at.push(Utc::now());
                    record.options.extend(options);
                    record
                } else if resume == ResumeMode::Must {
                    return Err(Error::tracking(format!(
                        "cannot resume tracking run {id}: {} not found",
                        run_file.display()
                    )));
                } else {
                    fs::create_dir_all(&dir)?;
                    RunRecord {
                        id: id.clone(),
                        name: id,
                        mode: TrackerMode::Online,
                        status: RunStatus::Running,
                        created_at: Utc::now(),
                        resumed_at: Vec::new(),
                        options,
                        config: serde_json::Value::Null,
                    }
                }
            }
        };

        let dir = run_dir(tracker_root, &record.id);
        let history = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(HISTORY_FILE))?;
        let tracker = Self {
            dir,
            record,
            history: BufWriter::new(history),
        };
        tracker.write_record()?;
        info!("Tracking run {} at {}", tracker.record.id, tracker.dir.display());
        Ok(tracker)
    }

    /// Directory of this tracking run
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_record(&self) -> Result<()> {
        fs::write(
            self.dir.join(RUN_FILE),
            serde_json::to_string_pretty(&self.record)?,
        )?;
        Ok(())
    }

    fn append(&mut self, entry: serde_json::Value) -> Result<()> {
        serde_json::to_writer(&mut self.history, &entry)?;
        self.history.write_all(b"\n")?;
        self.history.flush()?;
        Ok(())
    }
}

impl RunTracker for FileTracker {
    fn id(&self) -> &str {
        &self.record.id
    }

    fn log_scalars(&mut self, step: usize, values: &BTreeMap<String, f64>) -> Result<()> {
        self.append(json!({ "step": step, "time": Utc::now(), "scalars": values }))
    }

    fn log_image(&mut self, step: usize, key: &str, path: &Path) -> Result<()> {
        self.append(json!({
            "step": step,
            "time": Utc::now(),
            "image": { "key": key, "path": path.display().to_string() },
        }))
    }

    fn log_text(&mut self, step: usize, key: &str, value: &str) -> Result<()> {
        let mut text = serde_json::Map::new();
        text.insert(key.to_string(), value.into());
        self.append(json!({ "step": step, "time": Utc::now(), "text": text }))
    }

    fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.record.status = status;
        self.history.flush()?;
        self.write_record()?;
        debug!("Tracking run {} marked {:?}", self.record.id, status);
        Ok(())
    }
}

/// Open the tracker a run reports to
pub fn init_tracker(run_dir: &Path, init: TrackerInit, enabled: bool) -> Result<Box<dyn RunTracker>> {
    if !enabled {
        let id = match &init {
            TrackerInit::Resume { id, .. } => Some(id.clone()),
            TrackerInit::Fresh { .. } => None,
        };
        return Ok(Box::new(DisabledTracker::new(id)));
    }
    Ok(Box::new(FileTracker::init(&run_dir.join(TRACKER_DIR), init)?))
}

/// Persist the tracker id for later resumes
pub fn save_tracker_id(run_dir: &Path, id: &str) -> Result<()> {
    fs::write(run_dir.join(TRACKER_ID_FILE), id)?;
    Ok(())
}

/// Read the tracker id of a previous run
pub fn load_tracker_id(run_dir: &Path) -> Result<String> {
    let path = run_dir.join(TRACKER_ID_FILE);
    let id = fs::read_to_string(&path)
        .map_err(|e| Error::tracking(format!("cannot read {}: {e}", path.display())))?;
    let id = id.trim();
    if id.is_empty() {
        return Err(Error::tracking(format!("{} is empty", path.display())));
    }
    Ok(id.to_string())
}

fn run_dir(tracker_root: &Path, id: &str) -> PathBuf {
    tracker_root.join(format!("run-{id}"))
}

fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Local scalar dashboard stream (`tensorboard/scalars.jsonl`)
pub struct ScalarLogger {
    writer: BufWriter<File>,
}

impl ScalarLogger {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(SCALARS_FILE))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Write one scalar
    pub fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        if !value.is_finite() {
            warn!("Skipping non-finite scalar {} = {}", tag, value);
            return Ok(());
        }
        serde_json::to_writer(
            &mut self.writer,
            &json!({ "tag": tag, "value": value, "step": step, "wall_time": Utc::now() }),
        )?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    /// Write every entry of `values` under `prefix/`
    pub fn log_dict(&mut self, step: usize, prefix: &str, values: &BTreeMap<String, f64>) -> Result<()> {
        for (name, value) in values {
            self.log_scalar(&format!("{prefix}/{name}"), *value, step)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh(name: &str) -> TrackerInit {
        TrackerInit::Fresh {
            config: json!({ "trainer": { "name": "SlurppTrainer" } }),
            name: name.to_string(),
            mode: TrackerMode::Online,
            options: BTreeMap::new(),
        }
    }

    #[test]
    fn test_fresh_then_resume_same_run() {
        let dir = TempDir::new().unwrap();
        let mut tracker = init_tracker(dir.path(), fresh("uw_run"), true).unwrap();
        let id = tracker.id().to_string();
        save_tracker_id(dir.path(), &id).unwrap();
        tracker
            .log_scalars(1, &BTreeMap::from([("train/loss".to_string(), 0.5)]))
            .unwrap();
        tracker.finish(RunStatus::Finished).unwrap();

        let loaded = load_tracker_id(dir.path()).unwrap();
        assert_eq!(loaded, id);
        let resume = TrackerInit::Resume {
            id: loaded,
            resume: ResumeMode::Must,
            options: BTreeMap::new(),
        };
        let mut resumed = init_tracker(dir.path(), resume, true).unwrap();
        assert_eq!(resumed.id(), id);
        resumed.log_text(0, "slurm_job_id", "1234").unwrap();
        resumed.finish(RunStatus::Failed).unwrap();

        let run_dir = dir.path().join(TRACKER_DIR).join(format!("run-{id}"));
        let history = fs::read_to_string(run_dir.join(HISTORY_FILE)).unwrap();
        assert_eq!(history.lines().count(), 2);
        let record: RunRecord =
            serde_json::from_str(&fs::read_to_string(run_dir.join(RUN_FILE)).unwrap()).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.resumed_at.len(), 1);
        assert_eq!(record.name, "uw_run");
    }

    #[test]
    fn test_resume_must_requires_existing_run() {
        let dir = TempDir::new().unwrap();
        let resume = TrackerInit::Resume {
            id: "deadbeef".to_string(),
            resume: ResumeMode::Must,
            options: BTreeMap::new(),
        };
        assert!(matches!(
            init_tracker(dir.path(), resume, true),
            Err(Error::Tracking(_))
        ));
    }

    #[test]
    fn test_disabled_tracker_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut tracker = init_tracker(dir.path(), fresh("quiet"), false).unwrap();
        tracker.log_image(3, "vis", Path::new("x.png")).unwrap();
        tracker.finish(RunStatus::Finished).unwrap();
        assert!(!dir.path().join(TRACKER_DIR).exists());
        assert_eq!(tracker.id().len(), 8);
    }

    #[test]
    fn test_missing_tracker_id() {
        let dir = TempDir::new().unwrap();
        assert!(load_tracker_id(dir.path()).is_err());
    }

    #[test]
    fn test_scalar_logger_writes_prefixed_tags() {
        let dir = TempDir::new().unwrap();
        let mut logger = ScalarLogger::new(&dir.path().join("tensorboard")).unwrap();
        let values = BTreeMap::from([("loss".to_string(), 0.25), ("lr".to_string(), 1e-4)]);
        logger.log_dict(7, "train", &values).unwrap();
        logger.log_scalar("val/psnr", f64::NAN, 7).unwrap();

        let content = fs::read_to_string(dir.path().join("tensorboard").join(SCALARS_FILE)).unwrap();
        let tags: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["tag"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(tags, vec!["train/loss", "train/lr"]);
    }
}
