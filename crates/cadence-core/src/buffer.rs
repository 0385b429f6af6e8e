// Buffer — A numeric array shared between units, mirrored on a device
//
// A Buffer is allocated by the unit that produces it and handed to its
// consumers by reference: cloning a Buffer clones the handle, never the data.
// Identity survives graph mutation, so a buffer bound before an unlink/relink
// is the very same array afterwards.
//
// SYNC CONTRACT:
//
//   host write   → host_dirty   → update() copies host → device
//   device write → device_dirty → sync()   copies device → host
//
// Reading the host view while device_dirty is set is an error (StaleHost);
// touching the device view while host_dirty is set is an error (StaleDevice).
// The scheduler calls sync()/update() at unit boundaries so a unit always sees
// the latest data on its side. A buffer on the host device has no mirror and
// both calls are no-ops.
//
// PRODUCERS:
//
// At most one unit may produce a buffer per tick. Producers declare
// themselves through claim_producer(); a second claim in the same tick fails
// with ProducerConflict.

use std::fmt;
use std::sync::Arc;

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::device::{DeviceMemory, DeviceRef};
use crate::error::{Error, Result};

struct Mirror {
    device: DeviceRef,
    mem: DeviceMemory,
}

struct BufferState {
    name: String,
    shape: Vec<usize>,
    host: Vec<f64>,
    mirror: Option<Mirror>,
    host_dirty: bool,
    device_dirty: bool,
    producer: Option<(u64, String)>,
}

impl BufferState {
    fn sync(&mut self) -> Result<()> {
        if !self.device_dirty {
            return Ok(());
        }
        if let Some(mirror) = &self.mirror {
            mirror
                .device
                .download(&mirror.mem, &mut self.host)
                .map_err(|e| sync_error(&self.name, &mirror.device, e))?;
        }
        self.device_dirty = false;
        Ok(())
    }

    fn update(&mut self) -> Result<()> {
        if !self.host_dirty {
            return Ok(());
        }
        if let Some(mirror) = &mut self.mirror {
            mirror
                .device
                .upload(&self.host, &mut mirror.mem)
                .map_err(|e| sync_error(&self.name, &mirror.device, e))?;
        }
        self.host_dirty = false;
        Ok(())
    }
}

fn sync_error(buffer: &str, device: &DeviceRef, err: Error) -> Error {
    match err {
        Error::DeviceSync { reason, .. } => Error::DeviceSync {
            buffer: buffer.to_string(),
            device: device.name(),
            reason,
        },
        other => Error::DeviceSync {
            buffer: buffer.to_string(),
            device: device.name(),
            reason: other.to_string(),
        },
    }
}

/// Shared numeric array with a host view and an optional device mirror.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<RwLock<BufferState>>,
}

impl Buffer {
    /// Allocate a zero-filled buffer.
    pub fn zeros(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self::from_parts(name.into(), shape, vec![0.0; len])
    }

    /// Allocate a buffer from existing host data.
    pub fn from_vec(
        name: impl Into<String>,
        shape: impl Into<Vec<usize>>,
        data: Vec<f64>,
    ) -> Result<Self> {
        let name = name.into();
        let shape = shape.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::ShapeMismatch {
                name,
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self::from_parts(name, shape, data))
    }

    /// A single-element buffer, as used for counters and scalar metrics.
    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self::from_parts(name.into(), vec![1], vec![value])
    }

    fn from_parts(name: String, shape: Vec<usize>, host: Vec<f64>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BufferState {
                name,
                shape,
                host,
                mirror: None,
                host_dirty: false,
                device_dirty: false,
                producer: None,
            })),
        }
    }

    pub fn name(&self) -> String {
        self.inner.read().name.clone()
    }

    pub fn shape(&self) -> Vec<usize> {
        self.inner.read().shape.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles refer to the same array.
    pub fn same(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable identity of the underlying array, for logging and maps.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Give this buffer a mirror on `device`, seeded from the host array.
    ///
    /// Attaching to the host device, or re-attaching to the device that
    /// already holds the mirror, is a no-op.
    pub fn attach(&self, device: &DeviceRef) -> Result<()> {
        let mut s = self.inner.write();
        if device.is_host() {
            return Ok(());
        }
        if let Some(mirror) = &s.mirror {
            if Arc::ptr_eq(&mirror.device, device) {
                return Ok(());
            }
        }
        // Pull pending device data before moving to a new device.
        s.sync()?;
        let mut mem = device
            .alloc(s.host.len())
            .map_err(|e| sync_error(&s.name, device, e))?;
        device
            .upload(&s.host, &mut mem)
            .map_err(|e| sync_error(&s.name, device, e))?;
        s.mirror = Some(Mirror {
            device: Arc::clone(device),
            mem,
        });
        s.host_dirty = false;
        s.device_dirty = false;
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.inner.read().mirror.is_some()
    }

    /// Name of the device holding the mirror, or `"host"`.
    pub fn device_name(&self) -> String {
        match &self.inner.read().mirror {
            Some(m) => m.device.name(),
            None => "host".to_string(),
        }
    }

    /// Make the host view current (device → host) if the device was written.
    pub fn sync(&self) -> Result<()> {
        self.inner.write().sync()
    }

    /// Make the device mirror current (host → device) if the host was written.
    pub fn update(&self) -> Result<()> {
        self.inner.write().update()
    }

    pub fn is_host_dirty(&self) -> bool {
        self.inner.read().host_dirty
    }

    pub fn is_device_dirty(&self) -> bool {
        self.inner.read().device_dirty
    }

    /// Read the host view. Fails if the device holds unsynced writes.
    pub fn read(&self) -> Result<MappedRwLockReadGuard<'_, [f64]>> {
        let s = self.inner.read();
        if s.device_dirty {
            return Err(Error::StaleHost(s.name.clone()));
        }
        Ok(RwLockReadGuard::map(s, |s| s.host.as_slice()))
    }

    /// Write the host view; the device mirror becomes stale until `update()`.
    pub fn write(&self) -> Result<MappedRwLockWriteGuard<'_, [f64]>> {
        let mut s = self.inner.write();
        if s.device_dirty {
            return Err(Error::StaleHost(s.name.clone()));
        }
        if s.mirror.is_some() {
            s.host_dirty = true;
        }
        Ok(RwLockWriteGuard::map(s, |s| s.host.as_mut_slice()))
    }

    /// Read the device view. On the host device this is the host array.
    pub fn device_read(&self) -> Result<MappedRwLockReadGuard<'_, [f64]>> {
        let s = self.inner.read();
        if s.host_dirty {
            return Err(Error::StaleDevice(s.name.clone()));
        }
        Ok(RwLockReadGuard::map(s, |s| match &s.mirror {
            Some(m) => m.mem.as_slice(),
            None => s.host.as_slice(),
        }))
    }

    /// Write the device view; the host view becomes stale until `sync()`.
    pub fn device_write(&self) -> Result<MappedRwLockWriteGuard<'_, [f64]>> {
        let mut s = self.inner.write();
        if s.host_dirty {
            return Err(Error::StaleDevice(s.name.clone()));
        }
        if s.mirror.is_some() {
            s.device_dirty = true;
        }
        Ok(RwLockWriteGuard::map(s, |s| {
            let BufferState { mirror, host, .. } = s;
            match mirror {
                Some(m) => m.mem.as_mut_slice(),
                None => host.as_mut_slice(),
            }
        }))
    }

    /// Copy of the host view.
    pub fn to_vec(&self) -> Result<Vec<f64>> {
        Ok(self.read()?.to_vec())
    }

    pub fn get(&self, index: usize) -> Result<f64> {
        let host = self.read()?;
        host.get(index).copied().ok_or_else(|| {
            Error::msg(format!(
                "index {index} out of range for buffer of {} elements",
                host.len()
            ))
        })
    }

    pub fn set(&self, index: usize, value: f64) -> Result<()> {
        let mut host = self.write()?;
        let len = host.len();
        match host.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::msg(format!(
                "index {index} out of range for buffer of {len} elements"
            ))),
        }
    }

    /// Fill the host view with `value`.
    pub fn fill(&self, value: f64) -> Result<()> {
        self.write()?.fill(value);
        Ok(())
    }

    /// Replace the host contents, e.g. when restoring from a snapshot.
    pub fn load_host(&self, data: &[f64]) -> Result<()> {
        if self.len() != data.len() {
            return Err(Error::ShapeMismatch {
                name: self.name(),
                expected: self.shape(),
                got: vec![data.len()],
            });
        }
        self.write()?.copy_from_slice(data);
        Ok(())
    }

    /// Declare `unit` as this buffer's producer for `tick`.
    pub fn claim_producer(&self, unit: &str, tick: u64) -> Result<()> {
        let mut s = self.inner.write();
        match &s.producer {
            Some((t, first)) if *t == tick && first != unit => Err(Error::ProducerConflict {
                buffer: s.name.clone(),
                first: first.clone(),
                second: unit.to_string(),
                tick,
            }),
            _ => {
                s.producer = Some((tick, unit.to_string()));
                Ok(())
            }
        }
    }

    /// The unit that last claimed this buffer and the tick it did so in.
    pub fn producer(&self) -> Option<(u64, String)> {
        self.inner.read().producer.clone()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.inner.read();
        f.debug_struct("Buffer")
            .field("name", &s.name)
            .field("shape", &s.shape)
            .field("attached", &s.mirror.is_some())
            .field("host_dirty", &s.host_dirty)
            .field("device_dirty", &s.device_dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HostDevice, MirrorDevice};

    #[test]
    fn host_buffers_never_go_stale() {
        let b = Buffer::zeros("x", [4]);
        b.attach(&HostDevice::shared()).unwrap();
        b.device_write().unwrap()[0] = 3.0;
        assert!(!b.is_device_dirty());
        assert_eq!(b.get(0).unwrap(), 3.0);
    }

    #[test]
    fn reattach_same_device_keeps_mirror() {
        let dev: DeviceRef = Arc::new(MirrorDevice::new(0));
        let b = Buffer::scalar("n", 1.0);
        b.attach(&dev).unwrap();
        b.device_write().unwrap()[0] = 2.0;
        b.attach(&dev).unwrap();
        assert!(b.is_device_dirty());
    }
}
