use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;

// Device — Abstraction over the accelerator that mirrors shared buffers
//
// A Buffer always has a host-resident array. When a workflow runs on an
// accelerator, each buffer additionally owns a device-resident mirror that
// numeric kernels read and write. The Device trait is the narrow interface
// the engine needs from that accelerator: allocate a mirror and move bytes
// in both directions. Kernels themselves live outside this crate.
//
// Two devices ship with the core:
//   - HostDevice: no mirror at all, sync/update are no-ops
//   - MirrorDevice: an in-process mirror that keeps a separate copy and
//     counts transfers, used to exercise the sync contract

/// Where a unit's body executes. The scheduler uses it to decide whether a
/// unit's bound buffers need `sync()` (host) or `update()` (device) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Host,
    Device,
}

/// Memory allocated on a device for one buffer mirror.
///
/// Real accelerators keep this opaque; the in-process devices store the
/// elements directly.
#[derive(Debug, Clone, Default)]
pub struct DeviceMemory {
    data: Vec<f64>,
}

impl DeviceMemory {
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

/// A compute device that can hold buffer mirrors.
pub trait Device: fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device (e.g., "host", "mirror:0").
    fn name(&self) -> String;

    /// Whether buffers on this device share the host array (no mirror).
    fn is_host(&self) -> bool {
        false
    }

    /// Allocate a zeroed mirror of `len` elements.
    fn alloc(&self, len: usize) -> Result<DeviceMemory>;

    /// Copy the host array into the device mirror.
    fn upload(&self, host: &[f64], mem: &mut DeviceMemory) -> Result<()>;

    /// Copy the device mirror back into the host array. May block until
    /// outstanding device work on the mirror completes.
    fn download(&self, mem: &DeviceMemory, host: &mut [f64]) -> Result<()>;
}

/// Shared handle to a device.
pub type DeviceRef = Arc<dyn Device>;

/// The host itself. Buffers never get a mirror.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDevice;

impl HostDevice {
    pub fn shared() -> DeviceRef {
        Arc::new(HostDevice)
    }
}

impl Device for HostDevice {
    fn name(&self) -> String {
        "host".to_string()
    }

    fn is_host(&self) -> bool {
        true
    }

    fn alloc(&self, _len: usize) -> Result<DeviceMemory> {
        Ok(DeviceMemory::default())
    }

    fn upload(&self, _host: &[f64], _mem: &mut DeviceMemory) -> Result<()> {
        Ok(())
    }

    fn download(&self, _mem: &DeviceMemory, _host: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

/// Snapshot of the transfer counters of a [`MirrorDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferStats {
    /// Host → device copies.
    pub uploads: u64,
    /// Device → host copies.
    pub downloads: u64,
}

/// In-process accelerator that keeps a separate copy of every buffer.
///
/// Data written on one side is invisible on the other until the matching
/// transfer runs, which makes missing `sync()`/`update()` calls observable.
#[derive(Debug, Default)]
pub struct MirrorDevice {
    ordinal: usize,
    uploads: AtomicU64,
    downloads: AtomicU64,
}

impl MirrorDevice {
    pub fn new(ordinal: usize) -> Self {
        Self {
            ordinal,
            ..Default::default()
        }
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
        }
    }
}

impl Device for MirrorDevice {
    fn name(&self) -> String {
        format!("mirror:{}", self.ordinal)
    }

    fn alloc(&self, len: usize) -> Result<DeviceMemory> {
        Ok(DeviceMemory::zeroed(len))
    }

    fn upload(&self, host: &[f64], mem: &mut DeviceMemory) -> Result<()> {
        if host.len() != mem.len() {
            return Err(crate::Error::DeviceSync {
                buffer: String::new(),
                device: self.name(),
                reason: format!("upload of {} elements into mirror of {}", host.len(), mem.len()),
            });
        }
        mem.as_mut_slice().copy_from_slice(host);
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn download(&self, mem: &DeviceMemory, host: &mut [f64]) -> Result<()> {
        if host.len() != mem.len() {
            return Err(crate::Error::DeviceSync {
                buffer: String::new(),
                device: self.name(),
                reason: format!("download of {} elements into host of {}", mem.len(), host.len()),
            });
        }
        host.copy_from_slice(mem.as_slice());
        self.downloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
