use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use slurpp::logging::init_logging;
use slurpp::run::{resolve_base_dir, BASE_CKPT_DIR_ENV, BASE_DATA_DIR_ENV};
use slurpp::tracking::RunStatus;
use slurpp::training::SystemClock;
use slurpp::{LaunchOptions, NamingOptions, TrainingSession};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "slurpp-train")]
#[command(about = "Train a SLURPP underwater image restoration model", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Checkpoint to resume; --config and overrides are ignored
    #[arg(long = "resume_run")]
    resume_run: Option<PathBuf>,

    /// Directory to save runs in
    #[arg(long = "output_dir")]
    output_dir: Option<PathBuf>,

    /// Do not use cuda
    #[arg(long = "no_cuda")]
    no_cuda: bool,

    /// Save checkpoint and exit after X minutes; zero or negative disables
    #[arg(long = "exit_after", value_name = "MINUTES", allow_negative_numbers = true)]
    exit_after: Option<i64>,

    /// Run without experiment tracking
    #[arg(long = "no_wandb")]
    no_wandb: bool,

    /// Directory of training data (falls back to $BASE_DATA_DIR)
    #[arg(long = "base_data_dir")]
    base_data_dir: Option<PathBuf>,

    /// Directory of pretrained checkpoints (falls back to $BASE_CKPT_DIR)
    #[arg(long = "base_ckpt_dir")]
    base_ckpt_dir: Option<PathBuf>,

    /// Add datetime to the output folder name
    #[arg(long = "add_datetime_prefix")]
    add_datetime_prefix: bool,

    /// Prefix of the output folder name
    #[arg(long = "job_name_prefix", default_value = "")]
    job_name_prefix: String,

    /// Config override `key.path=value`, repeatable
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Local::now();
    let logging = init_logging().context("Failed to initialize logging")?;
    let cli = Cli::parse();

    let options = LaunchOptions {
        config: cli.config,
        resume_run: cli.resume_run,
        output_dir: cli.output_dir,
        no_cuda: cli.no_cuda,
        exit_after: exit_after_minutes(cli.exit_after),
        no_wandb: cli.no_wandb,
        base_data_dir: resolve_base_dir(cli.base_data_dir, BASE_DATA_DIR_ENV)
            .context("Failed to resolve the data directory")?,
        base_ckpt_dir: resolve_base_dir(cli.base_ckpt_dir, BASE_CKPT_DIR_ENV)
            .context("Failed to resolve the pretrained checkpoint directory")?,
        overrides: cli.overrides,
        naming: NamingOptions {
            add_datetime_prefix: cli.add_datetime_prefix,
            job_name_prefix: cli.job_name_prefix,
            start_time,
        },
        source_root: std::env::current_dir().context("Failed to read the working directory")?,
    };
    info!("Start time: {}", start_time.format("%Y-%m-%d %H:%M:%S"));

    let mut session =
        TrainingSession::prepare(options, &logging).context("Failed to prepare the training run")?;

    let t_end = session.deadline();
    let result = {
        let mut trainer = session
            .build_trainer(Arc::new(SystemClock))
            .context("Failed to set up training")?;
        trainer.train(t_end).await
    };

    let status = match result {
        Ok(outcome) => {
            info!(
                "Training done ({:?}), last checkpoint {}",
                outcome.reason,
                outcome.checkpoint.display()
            );
            RunStatus::Finished
        }
        Err(e) => {
            let chain = anyhow::Error::new(e);
            error!(error = format!("{chain:#}"), "Training failed");
            RunStatus::Failed
        }
    };

    if let Err(e) = session.finish(status) {
        error!("Failed to close the tracking run: {}", e);
    }
    Ok(())
}

/// Minutes until the timed exit; `None` when disabled
fn exit_after_minutes(value: Option<i64>) -> Option<u64> {
    value.filter(|minutes| *minutes > 0).map(|minutes| minutes as u64)
}
