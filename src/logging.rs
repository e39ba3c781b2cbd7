//! Console and run-file logging
//!
//! One `tracing` subscriber is installed at startup with a console layer and
//! a file layer. The file layer writes nowhere until the run directory exists
//! and [`LoggingHandle::attach_run_log`] opens `<run>/<logging.filename>`.
//! Console verbosity follows `RUST_LOG` when it is set and the configured
//! `logging.console_level` otherwise.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogLevel, LoggingConfig};
use crate::error::{Error, Result};

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Log file that can be opened after the subscriber is installed
#[derive(Clone, Default)]
pub struct LogFileSink {
    file: Arc<Mutex<Option<File>>>,
}

impl LogFileSink {
    /// Start appending to `path`
    pub fn open(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.file.lock() = Some(file);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }
}

/// Writer handed to the fmt layer for one event
pub struct SinkWriter<'a> {
    guard: MutexGuard<'a, Option<File>>,
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.guard.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.guard.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFileSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            guard: self.file.lock(),
        }
    }
}

/// Runtime controls of the installed subscriber
#[derive(Clone)]
pub struct LoggingHandle {
    console_level: Arc<RwLock<LevelFilter>>,
    file_level: Arc<RwLock<LevelFilter>>,
    env_override: bool,
    sink: LogFileSink,
}

impl LoggingHandle {
    pub fn new() -> Self {
        Self {
            console_level: Arc::new(RwLock::new(LevelFilter::INFO)),
            file_level: Arc::new(RwLock::new(LevelFilter::DEBUG)),
            env_override: std::env::var_os(EnvFilter::DEFAULT_ENV).is_some(),
            sink: LogFileSink::default(),
        }
    }

    /// Subscriber wired to this handle's levels and file sink
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        let env_layer = if self.env_override {
            EnvFilter::try_from_default_env()
                .ok()
                .map(|filter| fmt::layer().with_target(false).with_filter(filter))
        } else {
            None
        };

        let console_level = self.console_level.clone();
        let level_layer = env_layer.is_none().then(|| {
            fmt::layer()
                .with_target(false)
                .with_filter(filter_fn(move |meta| *meta.level() <= *console_level.read()))
        });

        let file_level = self.file_level.clone();
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(self.sink.clone())
            .with_filter(filter_fn(move |meta| *meta.level() <= *file_level.read()));

        tracing_subscriber::registry()
            .with(env_layer)
            .with(level_layer)
            .with(file_layer)
    }

    /// Apply the run's logging section and start writing `<run_dir>/<filename>`
    pub fn attach_run_log(&self, run_dir: &Path, config: &LoggingConfig) -> Result<()> {
        *self.console_level.write() = config.console_level.into();
        *self.file_level.write() = config.file_level.into();
        self.sink.open(&run_dir.join(&config.filename))
    }

    pub fn sink(&self) -> &LogFileSink {
        &self.sink
    }
}

impl Default for LoggingHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the global subscriber; console-only until a run log is attached
pub fn init_logging() -> Result<LoggingHandle> {
    let handle = LoggingHandle::new();
    handle
        .subscriber()
        .try_init()
        .map_err(|e| Error::internal(format!("failed to install logging: {e}")))?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing::{debug, info, trace};

    #[test]
    fn test_level_conversion() {
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
    }

    #[test]
    fn test_unattached_sink_discards() {
        let sink = LogFileSink::default();
        let mut writer = sink.make_writer();
        assert_eq!(writer.write(b"dropped").unwrap(), 7);
        assert!(!sink.is_open());
    }

    #[test]
    fn test_run_log_respects_file_level() {
        let dir = TempDir::new().unwrap();
        let handle = LoggingHandle::new();
        let config = LoggingConfig {
            filename: "logging.log".to_string(),
            console_level: LogLevel::Error,
            file_level: LogLevel::Debug,
        };

        tracing::subscriber::with_default(handle.subscriber(), || {
            info!("before the run directory exists");
            handle.attach_run_log(dir.path(), &config).unwrap();
            debug!("written to the run log");
            trace!("below the file level");
        });

        let content = std::fs::read_to_string(dir.path().join("logging.log")).unwrap();
        assert!(content.contains("written to the run log"));
        assert!(!content.contains("before the run directory exists"));
        assert!(!content.contains("below the file level"));
    }
}
