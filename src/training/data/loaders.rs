//! Prefetching data loader
//!
//! An epoch is planned up front: the sample order is a pure function of the
//! loader's shuffle seed and the epoch number, so a resumed run replays the
//! exact same batches. Batches are produced by worker tasks (decoding runs in
//! `spawn_blocking`) and delivered strictly in plan order.

use std::collections::VecDeque;
use std::sync::Arc;

use candle_core::Device;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument};

use super::{Batch, Dataset};
use crate::error::{Error, Result};

/// Batching options shared by the four run streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Samples per optimizer micro-batch
    pub batch_size: usize,
    /// Whether to reshuffle every epoch
    pub shuffle: bool,
    /// Number of worker tasks; 0 loads on the caller
    pub num_workers: usize,
    /// Batches queued ahead per worker
    pub prefetch_factor: usize,
    /// Drop a trailing batch shorter than `batch_size`
    pub drop_last: bool,
    /// Keep workers alive across epochs
    pub persistent_workers: bool,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            num_workers: 0,
            prefetch_factor: 2,
            drop_last: false,
            persistent_workers: false,
        }
    }
}

/// Async data loader over a [`Dataset`]
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    config: DataLoaderConfig,
    device: Device,
    shuffle_seed: u64,
    pool: Mutex<Option<Arc<WorkerPool>>>,
}

impl DataLoader {
    pub fn new(
        dataset: Arc<dyn Dataset>,
        config: DataLoaderConfig,
        device: Device,
        shuffle_seed: u64,
    ) -> Self {
        info!(
            "Creating DataLoader for {} with batch_size={}, num_workers={}, shuffle={}",
            dataset.name(),
            config.batch_size,
            config.num_workers,
            config.shuffle
        );
        Self {
            dataset,
            config,
            device,
            shuffle_seed,
            pool: Mutex::new(None),
        }
    }

    /// Batches in one epoch
    pub fn num_batches(&self) -> usize {
        let dataset_size = self.dataset.len();
        if self.config.drop_last {
            dataset_size / self.config.batch_size
        } else {
            dataset_size.div_ceil(self.config.batch_size)
        }
    }

    /// Number of samples behind the loader
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Seed the epoch orders are derived from
    pub fn shuffle_seed(&self) -> u64 {
        self.shuffle_seed
    }

    /// Replace the shuffle seed, e.g. with the one a checkpoint recorded
    pub fn reseed(&mut self, shuffle_seed: u64) {
        self.shuffle_seed = shuffle_seed;
    }

    /// Sample indices of every batch of `epoch`, in delivery order
    pub fn epoch_plan(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.shuffle_seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }

        let mut batches = Vec::with_capacity(self.num_batches());
        for chunk in indices.chunks(self.config.batch_size) {
            if self.config.drop_last && chunk.len() < self.config.batch_size {
                break;
            }
            batches.push(chunk.to_vec());
        }
        batches
    }

    /// Stream the batches of `epoch`, skipping the first `skip_batches`
    #[instrument(skip(self), fields(dataset = self.dataset.name()))]
    pub fn epoch(&self, epoch: usize, skip_batches: usize) -> Result<EpochStream> {
        let plan = self.epoch_plan(epoch);
        let total = plan.len();
        let remaining: VecDeque<Vec<usize>> = plan.into_iter().skip(skip_batches).collect();
        debug!(
            "Epoch {} plan: {} batches, resuming at {}",
            epoch,
            total,
            skip_batches.min(total)
        );

        let pool = if self.config.num_workers == 0 {
            None
        } else if self.config.persistent_workers {
            let mut guard = self.pool.lock();
            match guard.as_ref() {
                Some(pool) => Some(pool.clone()),
                None => {
                    let pool = Arc::new(self.spawn_pool()?);
                    *guard = Some(pool.clone());
                    Some(pool)
                }
            }
        } else {
            Some(Arc::new(self.spawn_pool()?))
        };

        Ok(EpochStream {
            dataset: self.dataset.clone(),
            device: self.device.clone(),
            pool,
            remaining,
            pending: VecDeque::new(),
            depth: (self.config.num_workers * self.config.prefetch_factor).max(1),
            position: skip_batches.min(total),
            total,
            epoch,
        })
    }

    fn spawn_pool(&self) -> Result<WorkerPool> {
        WorkerPool::spawn(
            self.dataset.clone(),
            self.device.clone(),
            self.config.num_workers,
            self.config.prefetch_factor,
        )
    }
}

/// Batches of one epoch, in plan order
pub struct EpochStream {
    dataset: Arc<dyn Dataset>,
    device: Device,
    pool: Option<Arc<WorkerPool>>,
    remaining: VecDeque<Vec<usize>>,
    pending: VecDeque<oneshot::Receiver<Result<Batch>>>,
    depth: usize,
    position: usize,
    total: usize,
    epoch: usize,
}

impl EpochStream {
    /// Next batch, or `None` once the epoch is exhausted
    pub async fn next(&mut self) -> Option<Result<Batch>> {
        let Some(pool) = self.pool.clone() else {
            let indices = self.remaining.pop_front()?;
            self.position += 1;
            return Some(load_batch(self.dataset.as_ref(), &indices, &self.device));
        };

        while self.pending.len() < self.depth {
            let Some(indices) = self.remaining.pop_front() else {
                break;
            };
            let batch_index = self.position + self.pending.len();
            match pool.submit(batch_index, indices).await {
                Ok(receiver) => self.pending.push_back(receiver),
                Err(e) => return Some(Err(e)),
            }
        }

        let Some(receiver) = self.pending.pop_front() else {
            debug!("Epoch {} completed: {} batches", self.epoch, self.total);
            return None;
        };
        self.position += 1;
        Some(
            receiver
                .await
                .unwrap_or_else(|_| Err(Error::data("loader worker dropped a batch"))),
        )
    }

    /// Index within the epoch of the next batch to be delivered
    pub fn position(&self) -> usize {
        self.position
    }

    /// Batches this stream yields in total
    pub fn total_batches(&self) -> usize {
        self.total
    }

    /// Epoch this stream belongs to
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

struct Job {
    indices: Vec<usize>,
    reply: oneshot::Sender<Result<Batch>>,
}

/// Worker tasks fed round-robin by batch index
struct WorkerPool {
    senders: Vec<mpsc::Sender<Job>>,
}

impl WorkerPool {
    fn spawn(
        dataset: Arc<dyn Dataset>,
        device: Device,
        num_workers: usize,
        queue_depth: usize,
    ) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::data(format!("loader workers need a tokio runtime: {e}")))?;

        let mut senders = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let (sender, receiver) = mpsc::channel(queue_depth.max(1));
            handle.spawn(worker_task(
                worker_id,
                dataset.clone(),
                device.clone(),
                receiver,
            ));
            senders.push(sender);
        }
        debug!("Spawned {} loader workers for {}", num_workers, dataset.name());
        Ok(Self { senders })
    }

    async fn submit(
        &self,
        batch_index: usize,
        indices: Vec<usize>,
    ) -> Result<oneshot::Receiver<Result<Batch>>> {
        let (reply, receiver) = oneshot::channel();
        let worker = batch_index % self.senders.len();
        self.senders[worker]
            .send(Job { indices, reply })
            .await
            .map_err(|_| Error::data(format!("loader worker {worker} has stopped")))?;
        Ok(receiver)
    }
}

async fn worker_task(
    worker_id: usize,
    dataset: Arc<dyn Dataset>,
    device: Device,
    mut receiver: mpsc::Receiver<Job>,
) {
    while let Some(Job { indices, reply }) = receiver.recv().await {
        let result = tokio::task::spawn_blocking({
            let dataset = dataset.clone();
            let device = device.clone();
            move || load_batch(dataset.as_ref(), &indices, &device)
        })
        .await
        .unwrap_or_else(|e| Err(Error::internal(format!("loader task panicked: {e}"))));

        if let Err(e) = &result {
            error!("Worker {} failed to load a batch: {}", worker_id, e);
        }
        if reply.send(result).is_err() {
            debug!("Worker {} result discarded", worker_id);
        }
    }
    debug!("Worker {} finished", worker_id);
}

fn load_batch(dataset: &dyn Dataset, indices: &[usize], device: &Device) -> Result<Batch> {
    let samples = indices
        .iter()
        .map(|&idx| dataset.get(idx))
        .collect::<Result<Vec<_>>>()?;
    Batch::collate(samples, device)
}

/// Builder for loaders over a sample subset
pub struct DataLoaderBuilder {
    dataset: Arc<dyn Dataset>,
    config: DataLoaderConfig,
    device: Device,
    shuffle_seed: u64,
}

impl DataLoaderBuilder {
    pub fn new(dataset: Arc<dyn Dataset>) -> Self {
        Self {
            dataset,
            config: DataLoaderConfig::default(),
            device: Device::Cpu,
            shuffle_seed: 0,
        }
    }

    /// Samples per batch
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    /// Reshuffle every epoch from `seed`
    pub fn shuffle(mut self, seed: u64) -> Self {
        self.config.shuffle = true;
        self.shuffle_seed = seed;
        self
    }

    /// Worker tasks decoding samples; 0 decodes inline
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    /// Batches buffered per worker
    pub fn prefetch_factor(mut self, prefetch_factor: usize) -> Self {
        self.config.prefetch_factor = prefetch_factor;
        self
    }

    /// Drop a short final batch
    pub fn drop_last(mut self, drop_last: bool) -> Self {
        self.config.drop_last = drop_last;
        self
    }

    /// Keep workers alive across epochs
    pub fn persistent_workers(mut self, persistent: bool) -> Self {
        self.config.persistent_workers = persistent;
        self
    }

    /// Device batches are staged on
    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Finish the loader; zero sizes are rejected
    pub fn build(self) -> Result<DataLoader> {
        if self.config.batch_size == 0 {
            return Err(Error::config("batch_size must be greater than 0"));
        }
        if self.config.prefetch_factor == 0 {
            return Err(Error::config("prefetch_factor must be greater than 0"));
        }
        Ok(DataLoader::new(
            self.dataset,
            self.config,
            self.device,
            self.shuffle_seed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::data::Sample;
    use candle_core::{DType, Tensor};

    struct CountingDataset {
        len: usize,
    }

    impl Dataset for CountingDataset {
        fn len(&self) -> usize {
            self.len
        }

        fn get(&self, index: usize) -> Result<Sample> {
            Ok(Sample {
                id: index.to_string(),
                input: Tensor::full(index as f32, (3, 2, 2), &Device::Cpu)?,
                target: Some(Tensor::zeros((3, 2, 2), DType::F32, &Device::Cpu)?),
            })
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn dataset(len: usize) -> Arc<dyn Dataset> {
        Arc::new(CountingDataset { len })
    }

    async fn collect_ids(stream: &mut EpochStream) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(batch) = stream.next().await {
            ids.extend(batch.unwrap().ids);
        }
        ids
    }

    #[test]
    fn test_epoch_plan_is_seeded() {
        let a = DataLoaderBuilder::new(dataset(10)).batch_size(3).shuffle(7).build().unwrap();
        let b = DataLoaderBuilder::new(dataset(10)).batch_size(3).shuffle(7).build().unwrap();
        assert_eq!(a.epoch_plan(0), b.epoch_plan(0));
        assert_ne!(a.epoch_plan(0), a.epoch_plan(1));
        assert_eq!(a.num_batches(), 4);
        assert_eq!(a.epoch_plan(0).last().unwrap().len(), 1);
    }

    #[test]
    fn test_drop_last_and_no_shuffle() {
        let loader = DataLoaderBuilder::new(dataset(7))
            .batch_size(2)
            .drop_last(true)
            .build()
            .unwrap();
        assert_eq!(loader.num_batches(), 3);
        assert_eq!(loader.epoch_plan(4), vec![vec![0, 1], vec![2, 3], vec![4, 5]]);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        assert!(DataLoaderBuilder::new(dataset(3)).batch_size(0).build().is_err());
    }

    #[tokio::test]
    async fn test_inline_loading_skips_batches() {
        let loader = DataLoaderBuilder::new(dataset(6)).batch_size(2).build().unwrap();
        let mut stream = loader.epoch(0, 1).unwrap();
        assert_eq!(stream.position(), 1);
        assert_eq!(collect_ids(&mut stream).await, vec!["2", "3", "4", "5"]);
        assert_eq!(stream.position(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_workers_deliver_in_plan_order() {
        let loader = DataLoaderBuilder::new(dataset(23))
            .batch_size(2)
            .shuffle(11)
            .num_workers(3)
            .prefetch_factor(2)
            .persistent_workers(true)
            .build()
            .unwrap();

        for epoch in 0..2 {
            let expected: Vec<String> = loader
                .epoch_plan(epoch)
                .into_iter()
                .flatten()
                .map(|i| i.to_string())
                .collect();
            let mut stream = loader.epoch(epoch, 0).unwrap();
            assert_eq!(collect_ids(&mut stream).await, expected);
        }
    }
}
