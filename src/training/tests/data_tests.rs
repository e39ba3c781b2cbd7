//! Tests for the four data streams

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;
use candle_core::Device;
use image::{Rgb, RgbImage};
use tempfile::TempDir;

use crate::config::tests::minimal_config;
use crate::seeding::RandomnessContext;
use crate::training::data::{build_dataloaders, DataLoader};

use super::fixtures::TrainerFixture;

async fn ids(loader: &DataLoader) -> Result<Vec<String>> {
    let mut stream = loader.epoch(0, 0)?;
    let mut ids = Vec::new();
    while let Some(batch) = stream.next().await {
        ids.extend(batch?.ids);
    }
    Ok(ids)
}

fn write_png(path: &Path, shade: u8) -> Result<()> {
    std::fs::create_dir_all(path.parent().unwrap())?;
    RgbImage::from_fn(12, 10, |x, y| Rgb([shade, x as u8 * 10, y as u8 * 10])).save(path)?;
    Ok(())
}

#[tokio::test]
async fn test_subsets_are_stable_across_run_seeds() -> Result<()> {
    let fixture = TrainerFixture::new(minimal_config())?.with_train_len(20);
    let first = fixture.dataloaders(&RandomnessContext::restore(1))?;
    let second = fixture.dataloaders(&RandomnessContext::restore(987_654))?;

    assert_eq!(ids(&first.val).await?, ids(&second.val).await?);
    assert_eq!(ids(&first.train_vis).await?, ids(&second.train_vis).await?);
    assert_eq!(ids(&first.real_vis).await?, ids(&second.real_vis).await?);
    assert_ne!(first.train.epoch_plan(0), second.train.epoch_plan(0));
    Ok(())
}

#[tokio::test]
async fn test_validation_and_visualization_are_disjoint() -> Result<()> {
    let mut config = minimal_config();
    config.dataloader.val_size = 5;
    config.dataloader.train_vis_size = 3;
    let fixture = TrainerFixture::new(config)?.with_train_len(20);
    let loaders = fixture.dataloaders(&RandomnessContext::restore(1))?;

    let val: HashSet<String> = ids(&loaders.val).await?.into_iter().collect();
    let vis: HashSet<String> = ids(&loaders.train_vis).await?.into_iter().collect();
    assert_eq!(val.len(), 5);
    assert_eq!(vis.len(), 3);
    assert!(val.is_disjoint(&vis));
    assert_eq!(loaders.val.config().batch_size, 1);
    assert!(!loaders.val.config().shuffle);
    Ok(())
}

#[tokio::test]
async fn test_train_stream_reshuffles_each_epoch() -> Result<()> {
    let fixture = TrainerFixture::new(minimal_config())?.with_train_len(32);
    let loaders = fixture.dataloaders(&RandomnessContext::restore(5))?;

    let epoch0 = loaders.train.epoch_plan(0);
    let epoch1 = loaders.train.epoch_plan(1);
    assert_ne!(epoch0, epoch1);
    assert_eq!(epoch0, loaders.train.epoch_plan(0));

    let mut seen: Vec<usize> = epoch1.into_iter().flatten().collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..32).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_stream_matches_inline_stream() -> Result<()> {
    let mut config = minimal_config();
    config.dataloader.num_workers = 3;
    let threaded = TrainerFixture::new(config)?.with_train_len(24);
    let inline = TrainerFixture::new(minimal_config())?.with_train_len(24);

    let randomness = RandomnessContext::restore(8);
    let threaded = threaded.dataloaders(&randomness)?;
    let inline = inline.dataloaders(&randomness)?;
    assert!(threaded.train.config().persistent_workers);

    for epoch in 0..2 {
        let mut a = threaded.train.epoch(epoch, 1)?;
        let mut b = inline.train.epoch(epoch, 1)?;
        while let Some(batch) = a.next().await {
            let other = b.next().await.expect("inline stream ended early")?;
            assert_eq!(batch?.ids, other.ids);
        }
        assert!(b.next().await.is_none());
    }
    Ok(())
}

#[tokio::test]
async fn test_build_dataloaders_from_image_folders() -> Result<()> {
    let data_root = TempDir::new()?;
    for i in 0..6u8 {
        let name = format!("img_{i}.png");
        write_png(&data_root.path().join("train/input").join(&name), i * 20)?;
        write_png(&data_root.path().join("train/target").join(&name), i * 30)?;
    }
    for i in 0..3u8 {
        write_png(&data_root.path().join(format!("real/real_{i}.png")), i)?;
    }

    let config = minimal_config();
    let randomness = RandomnessContext::restore(config.trainer.init_seed.unwrap());
    let loaders = build_dataloaders(&config, data_root.path(), &Device::Cpu, &randomness)?;

    assert_eq!(loaders.train.dataset_size(), 6);
    assert_eq!(loaders.train.num_batches(), 3);
    assert_eq!(loaders.real_vis.dataset_size(), 2);

    let mut stream = loaders.train.epoch(0, 0)?;
    let batch = stream.next().await.expect("one batch")?;
    assert_eq!(batch.input.dims(), &[2, 3, 8, 8]);
    assert_eq!(batch.target.expect("paired").dims(), &[2, 3, 8, 8]);

    let mut real = loaders.real_vis.epoch(0, 0)?;
    let sample = real.next().await.expect("one real image")?;
    assert!(sample.target.is_none());
    Ok(())
}

#[test]
fn test_missing_training_folder_is_rejected() {
    let data_root = TempDir::new().unwrap();
    let config = minimal_config();
    let result = build_dataloaders(
        &config,
        data_root.path(),
        &Device::Cpu,
        &RandomnessContext::restore(1),
    );
    assert!(result.is_err());
}
