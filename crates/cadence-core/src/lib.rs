//! # cadence-core
//!
//! Primitives shared by every cadence crate.
//!
//! This crate provides:
//! - [`Buffer`] — numeric array with a host view and a device mirror, plus the
//!   sync/update contract units rely on
//! - [`Device`] trait — the accelerator interface buffers mirror onto
//! - [`Signal`] / [`SignalRef`] — single-writer boolean cells used as gates
//! - [`Minibatch`] / [`MinibatchClass`] — the attributes a loader publishes
//! - [`Unit`] trait — the node type of a workflow graph, with its init/run
//!   contexts and named buffer bindings
//! - [`Error`] / [`Result`] — the error type used across the workspace

pub mod buffer;
pub mod device;
pub mod error;
pub mod minibatch;
pub mod signal;
pub mod unit;

pub use buffer::Buffer;
pub use device::{
    Device, DeviceMemory, DeviceRef, HostDevice, MirrorDevice, Residency, TransferStats,
};
pub use error::{Error, Result};
pub use minibatch::{ClassSamples, Minibatch, MinibatchClass, MinibatchState};
pub use signal::{Signal, SignalRef};
pub use unit::{Access, Binding, Bindings, Bound, InitContext, RunContext, Unit, UnitKind};
