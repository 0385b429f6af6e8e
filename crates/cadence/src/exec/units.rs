// Built-in units that give a workflow its shape
//
//   StartPoint → Repeater → (loop body) → back to Repeater
//                                 └──→ EndPoint (gated on completion)
//
// None of them touch buffers. The Repeater only matters to the scheduler
// through its UnitKind; the EndPoint releases a Completion that drivers can
// block on from another thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use cadence_core::{Result, RunContext, Unit, UnitKind};

/// Entry node of every workflow. Runs once per run, on the first tick.
#[derive(Debug, Default)]
pub struct StartPoint;

impl Unit for StartPoint {
    fn name(&self) -> &str {
        "start_point"
    }

    fn run(&mut self, _ctx: &RunContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Pass-through unit closing the training cycle.
///
/// It opens on any one of its predecessors. Reaching it a second time within
/// a tick makes the scheduler start the next tick from it.
#[derive(Debug, Default)]
pub struct Repeater;

impl Unit for Repeater {
    fn name(&self) -> &str {
        "repeater"
    }

    fn kind(&self) -> UnitKind {
        UnitKind::Repeater
    }

    fn run(&mut self, _ctx: &RunContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct CompletionState {
    done: Mutex<bool>,
    cond: Condvar,
}

/// One-shot "workflow finished" event, shareable across threads.
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<CompletionState>,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let mut done = self.inner.done.lock();
        *done = true;
        self.inner.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.inner.done.lock() = false;
    }

    pub fn is_released(&self) -> bool {
        *self.inner.done.lock()
    }

    /// Block until released.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock();
        while !*done {
            self.inner.cond.wait(&mut done);
        }
    }

    /// Block until released or `timeout` elapses; returns whether released.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.inner.done.lock();
        while !*done {
            if self.inner.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Completion(released={})", self.is_released())
    }
}

/// Terminal sentinel. Running it releases the workflow's waiters.
#[derive(Debug)]
pub struct EndPoint {
    completion: Completion,
}

impl EndPoint {
    pub fn new(completion: Completion) -> Self {
        Self { completion }
    }

    pub fn completion(&self) -> &Completion {
        &self.completion
    }
}

impl Unit for EndPoint {
    fn name(&self) -> &str {
        "end_point"
    }

    fn kind(&self) -> UnitKind {
        UnitKind::EndPoint
    }

    fn run(&mut self, ctx: &RunContext<'_>) -> Result<()> {
        log::info!("end point reached at tick {}", ctx.tick());
        self.completion.release();
        Ok(())
    }
}
