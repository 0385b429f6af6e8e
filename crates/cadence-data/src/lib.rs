//! # cadence-data
//!
//! Data sources for cadence workflows.
//!
//! This crate provides:
//! - [`Dataset`] trait — unified interface for any indexed sample source
//! - [`VecDataset`] / [`SyntheticBlobs`] — in-memory and generated datasets
//! - [`ClassLoader`] — the loader unit that lays samples out as
//!   test | validation | train and publishes one minibatch per tick

pub mod dataset;
pub mod loader;

pub use dataset::{Dataset, Sample, SyntheticBlobs, VecDataset};
pub use loader::{ClassLoader, LoaderConfig};
