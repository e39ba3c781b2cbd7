//! Deterministic dataset subsets
//!
//! Validation and visualization sets are drawn from a permutation with a fixed
//! seed, so the same images are scored and rendered in every run whatever its
//! run seed.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{Dataset, Sample};
use crate::error::{Error, Result};

/// Seed of every subset permutation
pub const SUBSET_SEED: u64 = 42;

/// Permutation of `0..len` fully determined by `seed`
pub fn fixed_permutation(len: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut StdRng::seed_from_u64(seed));
    indices
}

/// Disjoint train-visualization and validation indices of one permutation.
///
/// Visualization takes `[0, vis_size)` and validation takes
/// `[vis_size, vis_size + val_size)`, both clamped to `len`.
pub fn visualization_and_validation_indices(
    len: usize,
    vis_size: usize,
    val_size: usize,
) -> (Vec<usize>, Vec<usize>) {
    let permutation = fixed_permutation(len, SUBSET_SEED);
    let vis_end = vis_size.min(len);
    let val_end = vis_end.saturating_add(val_size).min(len);
    (
        permutation[..vis_end].to_vec(),
        permutation[vis_end..val_end].to_vec(),
    )
}

/// A view of selected indices of another dataset
pub struct Subset {
    dataset: Arc<dyn Dataset>,
    indices: Vec<usize>,
    name: String,
}

impl Subset {
    pub fn new(dataset: Arc<dyn Dataset>, indices: Vec<usize>) -> Result<Self> {
        if let Some(bad) = indices.iter().find(|&&i| i >= dataset.len()) {
            return Err(Error::data(format!(
                "subset index {bad} out of range for {} ({} samples)",
                dataset.name(),
                dataset.len()
            )));
        }
        let name = format!("{}[subset]", dataset.name());
        Ok(Self {
            dataset,
            indices,
            name,
        })
    }

    /// First `size` entries of the fixed-seed permutation of `dataset`
    pub fn fixed(dataset: Arc<dyn Dataset>, size: usize) -> Result<Self> {
        let mut indices = fixed_permutation(dataset.len(), SUBSET_SEED);
        indices.truncate(size);
        Self::new(dataset, indices)
    }

    /// Indices into the wrapped dataset, in subset order
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl Dataset for Subset {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let inner = self.indices.get(index).ok_or_else(|| {
            Error::data(format!("invalid sample index: {index} >= {}", self.len()))
        })?;
        self.dataset.get(*inner)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
