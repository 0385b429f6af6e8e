// Decision — Epoch bookkeeping and the stop/snapshot state machine
//
// Decision runs once per tick, after the evaluator. It reads the minibatch
// attributes the loader published and, on the last minibatch of a class,
// folds that class's statistics into its epoch state:
//
//   every tick        epoch_ended ← false
//                     gd_skip     ← class is test or validation
//
//   last of class c   n_err[c] += minibatch_n_err
//                     epoch_n_err_pt[c] = 100 * n_err[c] / samples[c]
//                     epoch_metrics[c] from minibatch_metrics, if bound
//
//   last of the       strictly fewer errors than the best so far
//   evaluation class    → best_epoch = epoch, snapshot if below threshold
//                     epoch - best_epoch > fail_iterations → complete
//
//   last of train     epoch_number += 1, epoch_ended ← true, n_err ← 0
//                     first rows of sample_input/sample_output kept
//                     epoch_number == max_epochs → complete
//
//   every last        minibatch_n_err / metrics / confusion buffers reset
//                     per-sample errors of the pass published as all_mse[c]
//
// When `minibatch_mse` is bound, every tick copies its first `size` rows into
// a per-class vector at the minibatch's position within its class.
//
// The evaluation class is validation when it has samples and train
// otherwise. `complete` is a latch: once set, only the driver clears it.

use std::time::Instant;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use cadence_core::{
    Binding, Buffer, ClassSamples, Error, InitContext, Minibatch, MinibatchClass,
    MinibatchState, Result, RunContext, Signal, SignalRef, Unit,
};

use crate::checkpoint::{CheckpointWriter, NamedArray, Snapshot};
use crate::metrics::{self, ConfusionMatrix, METRIC_MAX, METRIC_MIN, METRIC_SUM, MIN_SENTINEL};

// Configuration

/// Stop and snapshot policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Epochs without improvement tolerated before stopping.
    pub fail_iterations: u64,
    /// Stop once this many epochs have been trained.
    pub max_epochs: Option<u64>,
    /// Only snapshot improvements whose error % is below this bound.
    pub snapshot_threshold: f64,
    /// Sync parameter buffers to host at the end of every epoch.
    pub sync_parameters_on_epoch: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            fail_iterations: 100,
            max_epochs: None,
            snapshot_threshold: 100.0,
            sync_parameters_on_epoch: false,
        }
    }
}

impl DecisionConfig {
    pub fn fail_iterations(mut self, n: u64) -> Self {
        self.fail_iterations = n;
        self
    }

    pub fn max_epochs(mut self, n: u64) -> Self {
        self.max_epochs = Some(n);
        self
    }

    pub fn snapshot_threshold(mut self, pct: f64) -> Self {
        self.snapshot_threshold = pct;
        self
    }

    pub fn sync_parameters_on_epoch(mut self, sync: bool) -> Self {
        self.sync_parameters_on_epoch = sync;
        self
    }
}

// State

/// Counters Decision keeps across ticks; this is what a snapshot restores.
///
/// Per-class arrays are indexed by [`MinibatchClass::index`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionState {
    pub epoch_number: u64,
    /// Errors counted so far in the current epoch.
    pub n_err: [u64; 3],
    /// Errors of the last completed pass over each class.
    pub epoch_n_err: [u64; 3],
    pub epoch_n_err_pt: [f64; 3],
    /// `[mean, max, min]` error of the last completed pass over each class.
    pub epoch_metrics: [[f64; 3]; 3],
    pub epoch_min_mse: [f64; 3],
    /// Fewest evaluation-class errors seen, and the epoch it was seen in.
    pub best_n_err: Option<u64>,
    pub best_epoch: Option<u64>,
}

impl Default for DecisionState {
    fn default() -> Self {
        Self {
            epoch_number: 0,
            n_err: [0; 3],
            epoch_n_err: [0; 3],
            epoch_n_err_pt: [100.0; 3],
            epoch_metrics: [[0.0, 0.0, MIN_SENTINEL]; 3],
            epoch_min_mse: [MIN_SENTINEL; 3],
            best_n_err: None,
            best_epoch: None,
        }
    }
}

// Decision unit

/// Decides, per tick, whether gradient descent runs, whether to snapshot and
/// whether the workflow is complete.
///
/// Bindings:
/// - `minibatch_n_err` (required): errors in the current class so far
/// - `minibatch_metrics` (optional): `[sum, max, min]` of per-sample error
/// - `minibatch_confusion_matrix` (optional): `[k, k]` counts
/// - `minibatch_mse` (optional): per-row error of the current minibatch
/// - `sample_input`, `sample_output` (optional): batches whose first row is
///   kept at the end of every train pass
///
/// The evaluator produces these buffers, so bind them here with
/// [`Access::Read`](cadence_core::Access). Decision clears them after each
/// class pass without claiming them.
pub struct Decision {
    name: String,
    config: DecisionConfig,
    minibatch: Minibatch,
    class_samples: ClassSamples,
    state: DecisionState,

    complete: Signal,
    gd_skip: Signal,
    epoch_ended: Signal,
    just_snapshotted: Signal,

    n_err: Binding,
    metrics: Binding,
    confusion: Binding,
    confusion_matrices: [Option<ConfusionMatrix>; 3],
    minibatch_mse: Binding,
    mse: [Vec<f64>; 3],
    all_mse: [Vec<f64>; 3],
    sample_input: Binding,
    sample_output: Binding,
    input_sample: Vec<f64>,
    output_sample: Vec<f64>,

    parameters: Vec<(String, Buffer)>,
    writer: Option<Box<dyn CheckpointWriter>>,
    snapshots_written: u64,
    epoch_started: Instant,
}

impl Decision {
    pub fn new(config: DecisionConfig, minibatch: Minibatch, class_samples: ClassSamples) -> Self {
        Self {
            name: "decision".to_string(),
            config,
            minibatch,
            class_samples,
            state: DecisionState::default(),
            complete: Signal::new("complete", false),
            gd_skip: Signal::new("gd_skip", false),
            epoch_ended: Signal::new("epoch_ended", false),
            just_snapshotted: Signal::new("just_snapshotted", false),
            n_err: Binding::Absent,
            metrics: Binding::Absent,
            confusion: Binding::Absent,
            confusion_matrices: [None, None, None],
            minibatch_mse: Binding::Absent,
            mse: Default::default(),
            all_mse: Default::default(),
            sample_input: Binding::Absent,
            sample_output: Binding::Absent,
            input_sample: Vec::new(),
            output_sample: Vec::new(),
            parameters: Vec::new(),
            writer: None,
            snapshots_written: 0,
            epoch_started: Instant::now(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Buffers saved in snapshots and synced at epoch end.
    pub fn with_parameters(mut self, params: Vec<(String, Buffer)>) -> Self {
        self.parameters = params;
        self
    }

    pub fn with_writer(mut self, writer: Box<dyn CheckpointWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut DecisionConfig {
        &mut self.config
    }

    pub fn state(&self) -> &DecisionState {
        &self.state
    }

    pub fn epoch_number(&self) -> u64 {
        self.state.epoch_number
    }

    pub fn best_epoch(&self) -> Option<u64> {
        self.state.best_epoch
    }

    pub fn snapshots_written(&self) -> u64 {
        self.snapshots_written
    }

    pub fn confusion_matrix(&self, class: MinibatchClass) -> Option<&ConfusionMatrix> {
        self.confusion_matrices[class.index()].as_ref()
    }

    /// Per-sample error of the last completed pass over `class`, indexed by
    /// position within the class. `None` unless `minibatch_mse` is bound.
    pub fn all_mse(&self, class: MinibatchClass) -> Option<&[f64]> {
        let v = &self.all_mse[class.index()];
        (!v.is_empty()).then_some(v.as_slice())
    }

    /// First input row of the last train minibatch of the previous epoch.
    pub fn sample_input(&self) -> Option<&[f64]> {
        (!self.input_sample.is_empty()).then_some(self.input_sample.as_slice())
    }

    /// First output row of the last train minibatch of the previous epoch.
    pub fn sample_output(&self) -> Option<&[f64]> {
        (!self.output_sample.is_empty()).then_some(self.output_sample.as_slice())
    }

    // Signals

    pub fn complete(&self) -> SignalRef {
        self.complete.reader()
    }

    pub fn gd_skip(&self) -> SignalRef {
        self.gd_skip.reader()
    }

    pub fn epoch_ended(&self) -> SignalRef {
        self.epoch_ended.reader()
    }

    pub fn just_snapshotted(&self) -> SignalRef {
        self.just_snapshotted.reader()
    }

    pub fn is_complete(&self) -> bool {
        self.complete.get()
    }

    // Resume

    /// Reinstate counters and best-epoch tracking from a saved state.
    pub fn restore(&mut self, state: DecisionState) {
        info!(
            "{}: restored at epoch {} (best epoch {:?})",
            self.name, state.epoch_number, state.best_epoch
        );
        // The resumed loader replays the epoch from its first minibatch.
        self.state = DecisionState {
            n_err: [0; 3],
            ..state
        };
        self.just_snapshotted.set(false);
        self.epoch_ended.set(false);
    }

    /// Restore decision state and refill parameter buffers from a snapshot.
    pub fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<usize> {
        let n = snapshot.restore_parameters(&self.parameters)?;
        self.restore(snapshot.decision.clone());
        Ok(n)
    }

    /// Clear the `complete` latch so a finished run can be continued.
    pub fn reset_complete(&mut self) {
        self.complete.set(false);
    }

    // Snapshots

    /// Current state and parameters as a snapshot.
    pub fn capture(&self) -> Result<Snapshot> {
        let eval = self.class_samples.evaluation_class().index();
        let parameters = self
            .parameters
            .iter()
            .map(|(name, buf)| NamedArray::capture(name, buf))
            .collect::<Result<Vec<_>>>()?;
        Ok(Snapshot {
            epoch_number: self.state.epoch_number,
            score: self.state.epoch_n_err_pt[eval],
            decision: self.state.clone(),
            parameters,
        })
    }

    /// Snapshot the run now. `just_snapshotted` is raised whether or not a
    /// writer is set; the return value says whether one persisted it.
    pub fn save_snapshot(&mut self) -> Result<bool> {
        self.just_snapshotted.set(true);
        if self.writer.is_none() {
            debug!(
                "{}: snapshot at epoch {} not persisted, no writer",
                self.name, self.state.epoch_number
            );
            return Ok(false);
        }
        let snapshot = self.capture()?;
        if let Some(writer) = self.writer.as_mut() {
            writer.write(&snapshot)?;
        }
        self.snapshots_written += 1;
        info!(
            "{}: snapshot at epoch {} ({:.2}%)",
            self.name, snapshot.epoch_number, snapshot.score
        );
        Ok(true)
    }

    // Per-tick steps

    fn on_last_minibatch(&mut self, class: MinibatchClass) -> Result<()> {
        let samples = self.class_samples.get(class);
        if samples == 0 {
            return Err(Error::EmptyClass {
                class: class.to_string(),
            });
        }
        let c = class.index();

        let n_err_buf = self
            .n_err
            .buffer()
            .ok_or_else(|| Error::msg(format!("{} used before initialize", self.name)))?;
        n_err_buf.sync()?;
        let raw = n_err_buf.get(0)?;
        let counted = self.state.n_err[c] as f64 + raw.round();
        if !raw.is_finite() || raw < 0.0 || counted > samples as f64 {
            return Err(Error::ErrorCountOutOfRange {
                class: class.to_string(),
                count: raw,
                samples,
            });
        }
        self.state.n_err[c] = counted as u64;
        self.state.epoch_n_err[c] = self.state.n_err[c];
        self.state.epoch_n_err_pt[c] = 100.0 * self.state.epoch_n_err[c] as f64 / samples as f64;

        if let Some(buf) = self.metrics.buffer() {
            buf.sync()?;
            let m = buf.read()?;
            let mean = m[METRIC_SUM] / samples as f64;
            self.state.epoch_metrics[c] = [mean, m[METRIC_MAX], m[METRIC_MIN]];
            self.state.epoch_min_mse[c] = self.state.epoch_min_mse[c].min(mean);
        }
        if let Some(buf) = self.confusion.buffer() {
            buf.sync()?;
            let k = buf.shape()[0];
            self.confusion_matrices[c] = Some(ConfusionMatrix::from_flat(&buf.read()?, k));
        }
        if self.minibatch_mse.is_present() {
            std::mem::swap(&mut self.all_mse[c], &mut self.mse[c]);
            self.mse[c].fill(0.0);
        }

        info!(
            "epoch {} {}: n_err {} of {} ({:.2}%), mean err {:.6}, max {:.6}",
            self.state.epoch_number,
            class,
            self.state.epoch_n_err[c],
            samples,
            self.state.epoch_n_err_pt[c],
            self.state.epoch_metrics[c][0],
            self.state.epoch_metrics[c][1]
        );

        if class == self.class_samples.evaluation_class() {
            self.evaluate(class)?;
        }
        if class == MinibatchClass::Train {
            self.end_epoch()?;
        }
        self.reset_minibatch_buffers()
    }

    fn evaluate(&mut self, class: MinibatchClass) -> Result<()> {
        let c = class.index();
        let n = self.state.epoch_n_err[c];
        let epoch = self.state.epoch_number;
        self.just_snapshotted.set(false);

        if self.state.best_n_err.map_or(true, |best| n < best) {
            self.state.best_n_err = Some(n);
            self.state.best_epoch = Some(epoch);
            if self.state.epoch_n_err_pt[c] < self.config.snapshot_threshold {
                self.save_snapshot()?;
            }
        }

        if let Some(best) = self.state.best_epoch {
            if epoch.saturating_sub(best) > self.config.fail_iterations && self.complete.latch() {
                info!(
                    "{}: no improvement since epoch {best} ({} epochs), stopping",
                    self.name,
                    epoch - best
                );
            }
        }
        Ok(())
    }

    fn end_epoch(&mut self) -> Result<()> {
        self.epoch_ended.set(true);
        self.state.epoch_number += 1;
        self.state.n_err = [0; 3];
        if self.config.sync_parameters_on_epoch {
            for (_, buf) in &self.parameters {
                buf.sync()?;
            }
        }
        info!(
            "{}: epoch {} done in {:.2?}",
            self.name,
            self.state.epoch_number - 1,
            self.epoch_started.elapsed()
        );
        self.epoch_started = Instant::now();
        if let Some(buf) = self.sample_input.buffer() {
            self.input_sample = first_row(buf)?;
        }
        if let Some(buf) = self.sample_output.buffer() {
            self.output_sample = first_row(buf)?;
        }

        if let Some(max) = self.config.max_epochs {
            if self.state.epoch_number >= max && self.complete.latch() {
                info!("{}: reached max_epochs {max}, stopping", self.name);
            }
        }
        Ok(())
    }

    /// Copy this minibatch's per-row errors into its class's vector.
    fn collect_mse(&mut self, mb: &MinibatchState) -> Result<()> {
        let Some(buf) = self.minibatch_mse.buffer() else {
            return Ok(());
        };
        let dest = &mut self.mse[mb.class.index()];
        let range = mb
            .offset
            .checked_sub(self.class_samples.start_offset(mb.class))
            .map(|start| start..start + mb.size)
            .filter(|r| r.end <= dest.len());
        let Some(range) = range else {
            return Err(Error::UnclassifiedMinibatch {
                offset: mb.offset,
                total: self.class_samples.total(),
            });
        };
        buf.sync()?;
        let src = buf.read()?;
        if src.len() < mb.size {
            return Err(Error::ShapeMismatch {
                name: buf.name(),
                expected: vec![mb.size],
                got: buf.shape(),
            });
        }
        dest[range].copy_from_slice(&src[..mb.size]);
        Ok(())
    }

    fn reset_minibatch_buffers(&mut self) -> Result<()> {
        if let Some(buf) = self.n_err.buffer() {
            buf.fill(0.0)?;
        }
        if let Some(buf) = self.metrics.buffer() {
            metrics::reset_metrics(&mut buf.write()?);
        }
        if let Some(buf) = self.confusion.buffer() {
            buf.fill(0.0)?;
        }
        Ok(())
    }
}

/// The first row of a `[rows, ...]` batch, synced to host.
fn first_row(buf: &Buffer) -> Result<Vec<f64>> {
    buf.sync()?;
    let width = buf.shape().iter().skip(1).product::<usize>();
    let data = buf.read()?;
    Ok(data[..width.min(data.len())].to_vec())
}

impl Unit for Decision {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, ctx: &InitContext<'_>) -> Result<()> {
        if self.class_samples.total() == 0 {
            return Err(Error::msg("decision needs at least one sample"));
        }
        let n_err = ctx.require("minibatch_n_err")?;
        if n_err.is_empty() {
            return Err(Error::ShapeMismatch {
                name: n_err.name(),
                expected: vec![1],
                got: n_err.shape(),
            });
        }

        let metrics = ctx.optional("minibatch_metrics");
        if let Some(buf) = metrics.buffer() {
            if buf.len() < 3 {
                return Err(Error::ShapeMismatch {
                    name: buf.name(),
                    expected: vec![3],
                    got: buf.shape(),
                });
            }
        }

        let confusion = ctx.optional("minibatch_confusion_matrix");
        if let Some(buf) = confusion.buffer() {
            let shape = buf.shape();
            if shape.len() != 2 || shape[0] != shape[1] {
                return Err(Error::ShapeMismatch {
                    name: buf.name(),
                    expected: vec![shape.first().copied().unwrap_or(0); 2],
                    got: shape,
                });
            }
        }

        self.minibatch_mse = ctx.optional("minibatch_mse");
        if self.minibatch_mse.is_present() {
            for class in MinibatchClass::ALL {
                let n = self.class_samples.get(class);
                self.mse[class.index()] = vec![0.0; n];
                self.all_mse[class.index()] = vec![0.0; n];
            }
        }
        self.sample_input = ctx.optional("sample_input");
        self.sample_output = ctx.optional("sample_output");

        self.n_err = Binding::Present(n_err);
        self.metrics = metrics;
        self.confusion = confusion;
        Ok(())
    }

    fn run(&mut self, _ctx: &RunContext<'_>) -> Result<()> {
        let mb = self.minibatch.get();
        self.epoch_ended.set(false);
        self.gd_skip.set(mb.class != MinibatchClass::Train);
        if self.class_samples.get(mb.class) > 0 {
            self.collect_mse(&mb)?;
        }
        if mb.last {
            self.on_last_minibatch(mb.class)?;
        }
        Ok(())
    }
}
