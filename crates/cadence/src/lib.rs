//! # Cadence
//!
//! A tick-driven unit-graph engine for iterative training loops.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use cadence::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `cadence-core` | Buffer, Device, Signal, Minibatch, Unit trait, Error |
//! | `cadence-data` | Dataset, ClassLoader |
//!
//! ## Modules
//!
//! - [`exec`] — LinkGraph, gates, the tick scheduler and the lifecycle units
//! - [`decision`] — epoch bookkeeping, stop and snapshot policy
//! - [`checkpoint`] — snapshot format and writers
//! - [`metrics`] — confusion matrix and per-minibatch error metrics
//! - [`profiler`] — per-unit run timing
//! - [`workflow`] — the graph plus its driver surface

/// Re-export core types.
pub use cadence_core::{
    bail, Access, Binding, Bindings, Bound, Buffer, ClassSamples, Device, DeviceMemory, DeviceRef,
    Error, HostDevice, InitContext, Minibatch, MinibatchClass, MinibatchState, MirrorDevice,
    Residency, Result, RunContext, Signal, SignalRef, TransferStats, Unit, UnitKind,
};

/// Re-export datasets and the loader.
pub mod data {
    pub use cadence_data::*;
}

/// Unit graph and scheduler.
pub mod exec;

/// Decision — epoch state machine.
pub mod decision;

/// Checkpoint — save and load run snapshots.
pub mod checkpoint;

/// Metrics — confusion matrix and error accumulators.
pub mod metrics;

/// Profiling — per-unit timing.
pub mod profiler;

/// Workflow — graph, lifecycle units and driver.
pub mod workflow;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::checkpoint::{
        CheckpointWriter, FileCheckpointWriter, MemoryCheckpointWriter, Snapshot,
    };
    pub use crate::data::{ClassLoader, Dataset, LoaderConfig, SyntheticBlobs, VecDataset};
    pub use crate::decision::{Decision, DecisionConfig, DecisionState};
    pub use crate::exec::{
        Completion, Gate, GateDecision, LinkGraph, RunReport, RuntimeConfig, Scheduler, UnitId,
    };
    pub use crate::metrics::ConfusionMatrix;
    pub use crate::profiler::{ProfileReport, Profiler};
    pub use crate::workflow::Workflow;
    pub use crate::{
        Access, Buffer, ClassSamples, Error, InitContext, Minibatch, MinibatchClass, Result,
        RunContext, Signal, SignalRef, Unit,
    };
}
