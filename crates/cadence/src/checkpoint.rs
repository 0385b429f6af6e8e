// Checkpoint — Snapshots of a training run: parameters plus decision state
//
// Binary snapshot format (.ckpt):
//
//   Header:
//     magic:   [u8; 4]  = b"CDNC"
//     version: u32 LE   = 1
//
//   Section 1: Parameters
//     tag: u8 = 0x01
//     count: u32 LE
//     For each parameter:
//       name_len: u32 LE
//       name:     [u8; name_len]  (UTF-8)
//       ndim:     u32 LE
//       dims:     [u32 LE; ndim]
//       len:      u64 LE
//       data:     [f64 LE; len]
//
//   Section 2: Decision state
//     tag: u8 = 0x02
//     json_len: u32 LE
//     json:     [u8; json_len]    (DecisionState as JSON)
//
//   Section 3: Metadata
//     tag: u8 = 0x03
//     epoch: u64 LE
//     score: f64 LE               (error % of the evaluation class)
//
//   EOF marker: u8 = 0xFF
//
// Usage:
//   checkpoint::save("run_12_3.40.ckpt", &snapshot)?;
//   let snapshot = checkpoint::load("run_12_3.40.ckpt")?;
//   snapshot.restore_parameters(&params)?;

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use cadence_core::{Buffer, Error, Result};

use crate::decision::DecisionState;

// Constants

const MAGIC: &[u8; 4] = b"CDNC";
const VERSION: u32 = 1;
const TAG_PARAMS: u8 = 0x01;
const TAG_DECISION: u8 = 0x02;
const TAG_METADATA: u8 = 0x03;
const TAG_EOF: u8 = 0xFF;

// Snapshot contents

/// Host copy of one parameter buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedArray {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NamedArray {
    /// Copy a buffer's current contents, syncing it from the device first.
    pub fn capture(name: &str, buffer: &Buffer) -> Result<Self> {
        buffer.sync()?;
        Ok(Self {
            name: name.to_string(),
            shape: buffer.shape(),
            data: buffer.to_vec()?,
        })
    }
}

/// Everything needed to resume a run: parameters, decision counters and the
/// epoch the snapshot was taken at.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub epoch_number: u64,
    /// Error percentage of the evaluation class when the snapshot was taken.
    pub score: f64,
    pub decision: DecisionState,
    pub parameters: Vec<NamedArray>,
}

impl Snapshot {
    pub fn parameter(&self, name: &str) -> Option<&NamedArray> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Refill each buffer from the parameter of the same name.
    pub fn restore_parameters(&self, params: &[(String, Buffer)]) -> Result<usize> {
        for (name, buffer) in params {
            let saved = self
                .parameter(name)
                .ok_or_else(|| Error::msg(format!("snapshot has no parameter '{name}'")))?;
            if saved.shape != buffer.shape() {
                return Err(Error::ShapeMismatch {
                    name: name.clone(),
                    expected: buffer.shape(),
                    got: saved.shape.clone(),
                });
            }
            buffer.sync()?;
            buffer.load_host(&saved.data)?;
        }
        Ok(params.len())
    }
}

// Low-level IO helpers

fn write_u8(w: &mut impl Write, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f64(w: &mut impl Write, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// A length or dimension as the format's u32 field.
fn write_len(w: &mut impl Write, len: usize, what: &str) -> Result<()> {
    let v = u32::try_from(len)
        .map_err(|_| Error::msg(format!("{what} of {len} does not fit the checkpoint format")))?;
    write_u32(w, v)?;
    Ok(())
}

fn read_string(r: &mut impl Read) -> Result<String> {
    let len = read_u32(r)? as usize;
    String::from_utf8(read_bytes(r, len)?)
        .map_err(|e| Error::msg(format!("Invalid UTF-8 name: {e}")))
}

// Write / read

/// Write a snapshot in the cadence checkpoint format.
pub fn write_snapshot(w: &mut impl Write, snapshot: &Snapshot) -> Result<()> {
    w.write_all(MAGIC)?;
    write_u32(w, VERSION)?;

    write_u8(w, TAG_PARAMS)?;
    write_len(w, snapshot.parameters.len(), "parameter count")?;
    for p in &snapshot.parameters {
        write_len(w, p.name.len(), "parameter name length")?;
        w.write_all(p.name.as_bytes())?;
        write_len(w, p.shape.len(), "rank")?;
        for &d in &p.shape {
            write_len(w, d, "dimension")?;
        }
        write_u64(w, p.data.len() as u64)?;
        for &v in &p.data {
            write_f64(w, v)?;
        }
    }

    let json = serde_json::to_vec(&snapshot.decision)
        .map_err(|e| Error::msg(format!("Failed to encode decision state: {e}")))?;
    write_u8(w, TAG_DECISION)?;
    write_len(w, json.len(), "decision state size")?;
    w.write_all(&json)?;

    write_u8(w, TAG_METADATA)?;
    write_u64(w, snapshot.epoch_number)?;
    write_f64(w, snapshot.score)?;

    write_u8(w, TAG_EOF)?;
    Ok(())
}

/// Read a snapshot written by [`write_snapshot`].
pub fn read_snapshot(r: &mut impl Read) -> Result<Snapshot> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::msg(format!(
            "Invalid checkpoint: expected magic {MAGIC:?}, got {magic:?}"
        )));
    }
    let version = read_u32(r)?;
    if version != VERSION {
        return Err(Error::msg(format!(
            "Unsupported checkpoint version: {version} (expected {VERSION})"
        )));
    }

    let mut parameters = Vec::new();
    let mut decision = None;
    let mut metadata = None;
    loop {
        match read_u8(r)? {
            TAG_PARAMS => {
                let count = read_u32(r)? as usize;
                for _ in 0..count {
                    let name = read_string(r)?;
                    let ndim = read_u32(r)? as usize;
                    let shape = (0..ndim)
                        .map(|_| read_u32(r).map(|d| d as usize))
                        .collect::<io::Result<Vec<_>>>()?;
                    let len = read_u64(r)?;
                    let elements = shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d));
                    let len = match elements {
                        Some(n) if u64::try_from(n).ok() == Some(len) => n,
                        _ => {
                            return Err(Error::msg(format!(
                                "corrupt checkpoint: parameter '{name}' has shape {shape:?} \
                                 but {len} elements"
                            )))
                        }
                    };
                    let data = (0..len)
                        .map(|_| read_f64(r))
                        .collect::<io::Result<Vec<_>>>()?;
                    parameters.push(NamedArray { name, shape, data });
                }
            }
            TAG_DECISION => {
                let len = read_u32(r)? as usize;
                let json = read_bytes(r, len)?;
                let state: DecisionState = serde_json::from_slice(&json)
                    .map_err(|e| Error::msg(format!("Invalid decision state: {e}")))?;
                decision = Some(state);
            }
            TAG_METADATA => {
                let epoch = read_u64(r)?;
                let score = read_f64(r)?;
                metadata = Some((epoch, score));
            }
            TAG_EOF => break,
            other => {
                return Err(Error::msg(format!(
                    "Unknown checkpoint section tag: 0x{other:02X}"
                )))
            }
        }
    }

    let decision = decision.ok_or_else(|| Error::msg("checkpoint has no decision section"))?;
    let (epoch_number, score) =
        metadata.ok_or_else(|| Error::msg("checkpoint has no metadata section"))?;
    Ok(Snapshot {
        epoch_number,
        score,
        decision,
        parameters,
    })
}

/// Serialize a snapshot to bytes.
pub fn to_bytes(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_snapshot(&mut buf, snapshot)?;
    Ok(buf)
}

/// Deserialize a snapshot from bytes.
pub fn from_bytes(data: &[u8]) -> Result<Snapshot> {
    let mut cursor = io::Cursor::new(data);
    read_snapshot(&mut cursor)
}

pub fn save(path: impl AsRef<Path>, snapshot: &Snapshot) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_snapshot(&mut w, snapshot)?;
    w.flush()?;
    Ok(())
}

pub fn load(path: impl AsRef<Path>) -> Result<Snapshot> {
    let mut r = BufReader::new(File::open(path)?);
    read_snapshot(&mut r)
}

// Writers

/// Destination for snapshots taken by Decision.
///
/// Writing a snapshot of an epoch that was already written replaces it.
pub trait CheckpointWriter: Send {
    fn write(&mut self, snapshot: &Snapshot) -> Result<()>;
}

/// Writes `{prefix}_{epoch}_{score:.2}.ckpt` files into a directory and keeps
/// only the latest one.
#[derive(Debug)]
pub struct FileCheckpointWriter {
    dir: PathBuf,
    prefix: String,
    last: Option<PathBuf>,
}

impl FileCheckpointWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_string(),
            last: None,
        }
    }

    pub fn path_for(&self, snapshot: &Snapshot) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{:.2}.ckpt",
            self.prefix, snapshot.epoch_number, snapshot.score
        ))
    }

    /// Write `snapshot` to `{prefix}_{tag}.ckpt`, outside the rotation: the
    /// file `write` keeps is neither replaced nor removed.
    pub fn write_aside(&self, snapshot: &Snapshot, tag: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}_{tag}.ckpt", self.prefix));
        save(&path, snapshot)?;
        info!("snapshot written to {}", path.display());
        Ok(path)
    }

    /// The file holding the most recent snapshot.
    pub fn last_path(&self) -> Option<&Path> {
        self.last.as_deref()
    }
}

impl CheckpointWriter for FileCheckpointWriter {
    fn write(&mut self, snapshot: &Snapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(snapshot);
        save(&path, snapshot)?;
        if let Some(prev) = self.last.replace(path.clone()) {
            if prev != path {
                match fs::remove_file(&prev) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        info!("snapshot written to {}", path.display());
        Ok(())
    }
}

/// Keeps snapshots in memory, one per epoch. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointWriter {
    snapshots: Arc<Mutex<Vec<Snapshot>>>,
}

impl MemoryCheckpointWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest(&self) -> Option<Snapshot> {
        self.snapshots.lock().last().cloned()
    }
}

impl CheckpointWriter for MemoryCheckpointWriter {
    fn write(&mut self, snapshot: &Snapshot) -> Result<()> {
        let mut store = self.snapshots.lock();
        match store
            .iter_mut()
            .find(|s| s.epoch_number == snapshot.epoch_number)
        {
            Some(existing) => *existing = snapshot.clone(),
            None => store.push(snapshot.clone()),
        }
        Ok(())
    }
}
