//! Deterministic seeding for training runs
//!
//! All stochastic consumers (dataset shuffling, subset selection, weight
//! initialisation, diffusion noise) draw from a [`RandomnessContext`] that is
//! constructed once per run and passed explicitly, instead of mutating
//! process-wide generators.

use candle_core::Device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Lower bound of the default seed range (signed 64-bit minimum)
pub const SEED_MIN: i128 = -0x8000_0000_0000_0000;

/// Upper bound of the default seed range (unsigned 64-bit maximum)
pub const SEED_MAX: i128 = 0xFFFF_FFFF_FFFF_FFFF;

/// Generate `length` seeds drawn uniformly from `[min_val, max_val]`.
///
/// A local generator is reseeded with `initial_seed`; the returned values are
/// in draw order. A missing seed is allowed but logged as a reproducibility
/// warning.
pub fn generate_seed_sequence(
    initial_seed: Option<u64>,
    length: usize,
    min_val: i128,
    max_val: i128,
) -> Result<Vec<i128>> {
    let sequence = SeedSequence::with_range(initial_seed, min_val, max_val)?;
    Ok(sequence.take(length).collect())
}

/// Lazily drawn, prefix-stable seed sequence.
///
/// The first `n` values never depend on how many values are drawn later, so a
/// resumed run can fast-forward to its saved cursor with [`SeedSequence::skip_to`].
#[derive(Debug, Clone)]
pub struct SeedSequence {
    rng: StdRng,
    source_seed: u64,
    min_val: i128,
    max_val: i128,
    position: usize,
}

impl SeedSequence {
    /// Sequence over the default 64-bit range
    pub fn new(initial_seed: Option<u64>) -> Self {
        let source_seed = resolve_seed(initial_seed);
        Self::from_source(source_seed, SEED_MIN, SEED_MAX)
    }

    /// Sequence over a caller-supplied inclusive range
    pub fn with_range(initial_seed: Option<u64>, min_val: i128, max_val: i128) -> Result<Self> {
        if min_val > max_val {
            return Err(Error::seed(format!(
                "min_val ({min_val}) must not exceed max_val ({max_val})"
            )));
        }
        let source_seed = resolve_seed(initial_seed);
        Ok(Self::from_source(source_seed, min_val, max_val))
    }

    fn from_source(source_seed: u64, min_val: i128, max_val: i128) -> Self {
        Self {
            rng: StdRng::seed_from_u64(source_seed),
            source_seed,
            min_val,
            max_val,
            position: 0,
        }
    }

    /// Number of values drawn so far
    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the cursor to `cursor`, regenerating from the start if needed
    pub fn skip_to(&mut self, cursor: usize) {
        if cursor < self.position {
            *self = Self::from_source(self.source_seed, self.min_val, self.max_val);
        }
        while self.position < cursor {
            self.next();
        }
    }

    /// Draw the next value folded into a `u64` generator seed
    pub fn next_u64(&mut self) -> u64 {
        self.next().map(seed_to_u64).unwrap_or_default()
    }
}

impl Iterator for SeedSequence {
    type Item = i128;

    fn next(&mut self) -> Option<i128> {
        self.position += 1;
        Some(self.rng.random_range(self.min_val..=self.max_val))
    }
}

/// Fold a sequence value into the `u64` domain accepted by generators
pub fn seed_to_u64(value: i128) -> u64 {
    value as u64
}

fn resolve_seed(initial_seed: Option<u64>) -> u64 {
    match initial_seed {
        Some(seed) => seed,
        None => {
            warn!("initial_seed is None, reproducibility is not guaranteed");
            rand::random()
        }
    }
}

/// Run-scoped source of all randomness.
#[derive(Debug, Clone)]
pub struct RandomnessContext {
    seed: u64,
    reproducible: bool,
}

impl RandomnessContext {
    /// Create a context from an optional configured seed
    pub fn new(seed: Option<u64>) -> Self {
        let reproducible = seed.is_some();
        Self {
            seed: resolve_seed(seed),
            reproducible,
        }
    }

    /// Rebuild the context of a previous run from its persisted seed
    pub fn restore(seed: u64) -> Self {
        Self {
            seed,
            reproducible: true,
        }
    }

    /// The run seed actually in use
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Whether the seed came from configuration rather than entropy
    pub fn is_reproducible(&self) -> bool {
        self.reproducible
    }

    /// Derive a stable sub-seed for a named consumer
    pub fn derive_seed(&self, label: &str) -> u64 {
        let mut rng = StdRng::seed_from_u64(self.seed ^ fnv1a(label.as_bytes()));
        rng.random()
    }

    /// Independent generator for a named consumer
    pub fn fork(&self, label: &str) -> StdRng {
        StdRng::seed_from_u64(self.derive_seed(label))
    }

    /// Per-step seed sequence rooted at the run seed
    pub fn step_seeds(&self) -> SeedSequence {
        SeedSequence::from_source(self.seed, SEED_MIN, SEED_MAX)
    }
}

/// Seed every generator the run uses and return the context owning them.
///
/// Accelerator devices get their generator seeded directly. The CPU backend
/// has no seedable generator, so training noise is always drawn through the
/// returned context.
pub fn seed_all(seed: Option<u64>, device: &Device) -> Result<RandomnessContext> {
    let context = RandomnessContext::new(seed);
    if !device.is_cpu() {
        device.set_seed(context.seed())?;
        debug!("Seeded accelerator generator with {}", context.seed());
    }
    info!(
        seed = context.seed(),
        reproducible = context.is_reproducible(),
        "Randomness context initialised"
    );
    Ok(context)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_deterministic() {
        let a = generate_seed_sequence(Some(2024), 16, SEED_MIN, SEED_MAX).unwrap();
        let b = generate_seed_sequence(Some(2024), 16, SEED_MIN, SEED_MAX).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_sequence_prefix_stability() {
        let short = generate_seed_sequence(Some(7), 5, SEED_MIN, SEED_MAX).unwrap();
        let long = generate_seed_sequence(Some(7), 50, SEED_MIN, SEED_MAX).unwrap();
        assert_eq!(&long[..5], short.as_slice());
    }

    #[test]
    fn test_different_seeds_differ() {
        let a = generate_seed_sequence(Some(1), 8, SEED_MIN, SEED_MAX).unwrap();
        let b = generate_seed_sequence(Some(2), 8, SEED_MIN, SEED_MAX).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_sequence() {
        let seeds = generate_seed_sequence(Some(3), 0, SEED_MIN, SEED_MAX).unwrap();
        assert!(seeds.is_empty());
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let result = generate_seed_sequence(Some(3), 4, 10, 5);
        assert!(matches!(result, Err(Error::Seed(_))));
    }

    #[test]
    fn test_values_stay_in_range() {
        let seeds = generate_seed_sequence(Some(11), 200, -3, 3).unwrap();
        assert!(seeds.iter().all(|s| (-3..=3).contains(s)));
    }

    #[test]
    fn test_unseeded_sequence_still_produces_values() {
        let seeds = generate_seed_sequence(None, 4, SEED_MIN, SEED_MAX).unwrap();
        assert_eq!(seeds.len(), 4);
    }

    #[test]
    fn test_skip_to_matches_fresh_draws() {
        let expected = generate_seed_sequence(Some(99), 10, SEED_MIN, SEED_MAX).unwrap();

        let mut seq = RandomnessContext::restore(99).step_seeds();
        seq.skip_to(6);
        assert_eq!(seq.position(), 6);
        assert_eq!(seq.next(), Some(expected[6]));

        seq.skip_to(2);
        assert_eq!(seq.next(), Some(expected[2]));
    }

    #[test]
    fn test_derived_seeds_are_stable_and_label_specific() {
        let ctx = RandomnessContext::new(Some(5));
        assert_eq!(ctx.derive_seed("train-shuffle"), ctx.derive_seed("train-shuffle"));
        assert_ne!(ctx.derive_seed("train-shuffle"), ctx.derive_seed("weights"));
        assert!(ctx.is_reproducible());

        let other = RandomnessContext::new(Some(6));
        assert_ne!(ctx.derive_seed("weights"), other.derive_seed("weights"));
    }

    #[test]
    fn test_seed_all_on_cpu() {
        let ctx = seed_all(Some(42), &Device::Cpu).unwrap();
        assert_eq!(ctx.seed(), 42);
    }
}
