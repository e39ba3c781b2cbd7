//! Test suite for the training infrastructure
//!
//! Covers the data streams, checkpoint publishing and the trainer state
//! machine end to end on small in-memory datasets.

pub mod data_tests;
pub mod trainer_tests;

pub mod fixtures;

pub use fixtures::{trainer_state, RecordingTracker, ToyDataset, ToyModel, TrainerFixture};
