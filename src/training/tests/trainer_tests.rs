//! Tests for the trainer state machine

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, TimeZone, Utc};

use crate::config::tests::minimal_config;
use crate::config::RunConfig;
use crate::model::parameter_tensors;
use crate::training::checkpoints::CheckpointManager;
use crate::training::{ExitReason, ManualClock, Phase, SystemClock};

use super::fixtures::TrainerFixture;

fn quiet_config() -> RunConfig {
    let mut config = minimal_config();
    config.trainer.max_epoch = 1;
    config.trainer.save_period = 0;
    config.trainer.validation_period = 0;
    config.trainer.visualization_period = 0;
    config
}

#[tokio::test]
async fn test_one_optimizer_step_per_accumulation_window() -> Result<()> {
    let mut config = quiet_config();
    config.dataloader.max_train_batch_size = 4;
    config.dataloader.effective_batch_size = 16;
    let mut fixture = TrainerFixture::new(config)?.with_train_len(64);

    let (outcome, state) = {
        let mut trainer = fixture.trainer(2024, Arc::new(SystemClock))?;
        assert_eq!(trainer.accumulation_steps(), 4);
        assert_eq!(trainer.train_loader().num_batches(), 16);
        let outcome = trainer.train(None).await?;
        (outcome, trainer.state().clone())
    };

    assert_eq!(outcome.reason, ExitReason::MaxEpoch);
    assert_eq!(state.effective_iter, 4);
    assert_eq!(state.optimizer_steps, 4);
    assert_eq!(state.accumulated_batches, 0);
    assert_eq!(state.seed_cursor, 16);
    assert_eq!(fixture.tracker.optimizer_steps(), vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn test_deadline_forces_exactly_one_checkpoint() -> Result<()> {
    let mut config = quiet_config();
    config.trainer.max_epoch = 100;
    let mut fixture = TrainerFixture::new(config)?;

    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    // Each boundary reads the clock once and moves it 40 seconds on.
    let clock = Arc::new(ManualClock::with_tick(start, Duration::seconds(40)));
    let t_end = start + Duration::minutes(1);

    let mut trainer = fixture.trainer(2024, clock)?;
    let outcome = trainer.train(Some(t_end)).await?;

    assert_eq!(outcome.reason, ExitReason::Deadline);
    assert_eq!(outcome.effective_iter, 3);
    assert_eq!(trainer.saved_checkpoints().len(), 1);
    assert_eq!(
        trainer.phase_history(),
        &[
            Phase::Init,
            Phase::Running,
            Phase::Checkpointing,
            Phase::Exiting,
            Phase::Terminated
        ]
    );
    assert_eq!(trainer.phase(), Phase::Terminated);

    let manager = CheckpointManager::new(&fixture.identity.checkpoint_dir(), None, 0)?;
    assert_eq!(manager.snapshots()?.len(), 1);
    assert_eq!(manager.latest()?, Some(outcome.checkpoint.clone()));
    Ok(())
}

#[tokio::test]
async fn test_max_iter_stops_with_final_checkpoint() -> Result<()> {
    let mut config = quiet_config();
    config.trainer.max_epoch = 10;
    config.trainer.max_iter = 5;
    let mut fixture = TrainerFixture::new(config)?;

    let mut trainer = fixture.trainer(7, Arc::new(SystemClock))?;
    let outcome = trainer.train(None).await?;

    assert_eq!(outcome.reason, ExitReason::MaxIter);
    assert_eq!(outcome.effective_iter, 5);
    assert!(outcome.checkpoint.ends_with("iter_000005"));
    Ok(())
}

#[tokio::test]
async fn test_periodic_detours_write_artifacts() -> Result<()> {
    let mut config = quiet_config();
    config.trainer.max_iter = 2;
    config.trainer.save_period = 1;
    config.trainer.validation_period = 1;
    config.trainer.visualization_period = 2;
    config.validation.denoising_steps = 2;
    let mut fixture = TrainerFixture::new(config)?;

    let history = {
        let mut trainer = fixture.trainer(11, Arc::new(SystemClock))?;
        trainer.train(None).await?;
        assert!(trainer.state().best_metric.is_some());
        assert_eq!(trainer.state().best_iter.map(|i| i >= 1), Some(true));
        trainer.phase_history().to_vec()
    };

    assert_eq!(
        history,
        vec![
            Phase::Init,
            Phase::Running,
            Phase::Checkpointing,
            Phase::Running,
            Phase::Evaluating,
            Phase::Running,
            Phase::Checkpointing,
            Phase::Exiting,
            Phase::Terminated,
        ]
    );

    let metrics = fixture.identity.evaluation_dir().join("iter_000001/metrics.json");
    let record: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(metrics)?)?;
    assert_eq!(record["iter"], 1);
    assert!(record["metrics"]["mse"].is_number());
    Ok(())
}

#[tokio::test]
async fn test_visualization_writes_both_subsets() -> Result<()> {
    let mut fixture = TrainerFixture::new(quiet_config())?;

    let written = {
        let mut trainer = fixture.trainer(3, Arc::new(SystemClock))?;
        trainer.visualize().await?
    };

    let vis_root = fixture.identity.visualization_dir().join("iter_000000");
    assert_eq!(written.len(), 4);
    assert_eq!(
        written.iter().filter(|p| p.starts_with(vis_root.join("train"))).count(),
        2
    );
    assert_eq!(
        written.iter().filter(|p| p.starts_with(vis_root.join("real"))).count(),
        2
    );
    assert_eq!(fixture.tracker.images.len(), 4);

    // Paired panels are input | restoration | target.
    let panel = image::open(&written[0])?;
    assert_eq!(panel.width(), 3 * super::fixtures::TOY_IMAGE_SIZE as u32);
    Ok(())
}

#[tokio::test]
async fn test_resume_restores_state_and_batch_order() -> Result<()> {
    let mut config = quiet_config();
    config.trainer.max_epoch = 3;
    config.trainer.max_iter = 3;
    let mut fixture = TrainerFixture::new(config)?;

    let (saved_state, checkpoint, next_seed, weights) = {
        let mut trainer = fixture.trainer(2024, Arc::new(SystemClock))?;
        let outcome = trainer.train(None).await?;
        let weights = parameter_tensors(&trainer.model().parameters()?);
        (
            trainer.state().clone(),
            outcome.checkpoint,
            trainer.peek_batch_seed(),
            weights,
        )
    };
    let expected_plan = {
        let trainer = fixture.trainer(2024, Arc::new(SystemClock))?;
        trainer.train_loader().epoch_plan(saved_state.epoch)
    };

    // Different run seed before loading: everything must come from the checkpoint.
    let mut resumed = fixture.trainer(99, Arc::new(SystemClock))?;
    assert_ne!(resumed.peek_batch_seed(), next_seed);
    resumed.load_checkpoint(&checkpoint, true, true)?;

    assert_eq!(resumed.state(), &saved_state);
    assert_eq!(resumed.peek_batch_seed(), next_seed);
    assert_eq!(
        resumed.train_loader().epoch_plan(saved_state.epoch),
        expected_plan
    );
    let remaining = &expected_plan[saved_state.batch_in_epoch..];
    let resumed_plan = resumed.train_loader().epoch_plan(saved_state.epoch);
    assert_eq!(&resumed_plan[saved_state.batch_in_epoch..], remaining);

    for (name, var) in resumed.model().parameters()? {
        let restored: Vec<f32> = var.as_tensor().to_vec1()?;
        let original: Vec<f32> = weights[&name].to_vec1()?;
        assert_eq!(restored, original, "parameter {name}");
    }
    Ok(())
}

#[tokio::test]
async fn test_weights_only_load_keeps_fresh_counters() -> Result<()> {
    let mut config = quiet_config();
    config.trainer.max_iter = 2;
    let mut fixture = TrainerFixture::new(config)?;

    let checkpoint = {
        let mut trainer = fixture.trainer(5, Arc::new(SystemClock))?;
        trainer.train(None).await?.checkpoint
    };

    let mut fine_tuned = fixture.trainer(5, Arc::new(SystemClock))?;
    fine_tuned.load_checkpoint(&checkpoint, false, false)?;
    assert_eq!(fine_tuned.state().effective_iter, 0);
    assert_eq!(fine_tuned.state().seed_cursor, 0);
    Ok(())
}

#[tokio::test]
async fn test_resume_without_scheduler_restarts_schedule() -> Result<()> {
    let mut config = quiet_config();
    config.trainer.max_iter = 2;
    let mut fixture = TrainerFixture::new(config)?;

    let checkpoint = {
        let mut trainer = fixture.trainer(5, Arc::new(SystemClock))?;
        trainer.train(None).await?.checkpoint
    };

    let mut resumed = fixture.trainer(5, Arc::new(SystemClock))?;
    resumed.load_checkpoint(&checkpoint, true, false)?;
    assert_eq!(resumed.state().effective_iter, 2);
    assert_eq!(resumed.state().scheduler.step_count, 0);
    Ok(())
}

#[tokio::test]
async fn test_resume_load_supersedes_fine_tune_load() -> Result<()> {
    let mut fine_tune_config = quiet_config();
    fine_tune_config.trainer.max_iter = 2;
    let mut fine_tune_fixture = TrainerFixture::new(fine_tune_config)?;
    let fine_tune = {
        let mut trainer = fine_tune_fixture.trainer(5, Arc::new(SystemClock))?;
        trainer.train(None).await?.checkpoint
    };

    let mut config = quiet_config();
    config.trainer.max_epoch = 3;
    config.trainer.max_iter = 3;
    let mut fixture = TrainerFixture::new(config)?;
    let (saved_state, resume_from, next_seed, weights) = {
        let mut trainer = fixture.trainer(2024, Arc::new(SystemClock))?;
        let outcome = trainer.train(None).await?;
        (
            trainer.state().clone(),
            outcome.checkpoint,
            trainer.peek_batch_seed(),
            parameter_tensors(&trainer.model().parameters()?),
        )
    };

    let mut trainer = fixture.trainer(99, Arc::new(SystemClock))?;
    trainer.load_checkpoint(&fine_tune, false, false)?;
    assert_eq!(trainer.state().effective_iter, 0);
    trainer.load_checkpoint(&resume_from, true, true)?;

    assert_eq!(trainer.state(), &saved_state);
    assert_eq!(trainer.state().scheduler.step_count, 3);
    assert_eq!(trainer.peek_batch_seed(), next_seed);
    for (name, var) in trainer.model().parameters()? {
        let restored: Vec<f32> = var.as_tensor().to_vec1()?;
        let expected: Vec<f32> = weights[&name].to_vec1()?;
        assert_eq!(restored, expected, "parameter {name}");
    }

    // Training continues from the resumed counters.
    let outcome = trainer.train(None).await?;
    assert_eq!(outcome.effective_iter, saved_state.effective_iter + 1);
    Ok(())
}
