// Engine — Tick-driven scheduler over a LinkGraph
//
// A run is a sequence of ticks. Within one tick:
//
//   1. Enter at the start point (first tick) or at the repeater (later ticks).
//   2. Walk links_to depth-first. A unit opens once every predecessor has
//      passed control to it this tick; a Repeater opens on the first one.
//   3. On open, resolve the unit's gates. Block ends that branch. Skip passes
//      control on without running the body. Run syncs the unit's bound
//      buffers to its side, claims the ones it writes, and runs the body.
//   4. Control reaching a Repeater that already ran this tick marks re-entry.
//      The tick still drains its remaining branches first.
//
// The run ends after the first tick that did not mark re-entry. Every unit
// runs at most once per tick, in a linear extension of the link order.

use std::time::Instant;

use log::{debug, info};

use cadence_core::{
    DeviceRef, Error, HostDevice, InitContext, Residency, Result, RunContext, UnitKind,
};

use super::gate::{self, GateDecision};
use super::graph::{LinkGraph, Node, UnitId};
use crate::profiler::{ProfileReport, Profiler};

// Runtime configuration

/// How a workflow is initialized and run.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Device buffers are mirrored onto at initialize time.
    pub device: DeviceRef,
    /// Suspend the run after this many ticks (it can be resumed).
    pub max_ticks: Option<u64>,
    /// Aggregate per-unit run timings.
    pub profile: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: HostDevice::shared(),
            max_ticks: None,
            profile: false,
        }
    }
}

impl RuntimeConfig {
    pub fn with_device(mut self, device: DeviceRef) -> Self {
        self.device = device;
        self
    }

    pub fn with_max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = Some(ticks);
        self
    }

    pub fn with_profiling(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }
}

// Run report

/// Counters for one call to `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub ticks: u64,
    pub units_run: u64,
    pub skipped: u64,
    pub blocked: u64,
    /// False when the run was suspended by a tick limit rather than ending.
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Pending,
    Done,
    Blocked,
}

// Scheduler

/// Drives ticks over a graph. Keeps the tick counter and the resume point
/// across calls so a suspended run continues where it stopped.
pub struct Scheduler {
    config: RuntimeConfig,
    profiler: Profiler,
    tick: u64,
    resume_at: Option<UnitId>,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            profiler: Profiler::new(),
            tick: 0,
            resume_at: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn reconfigure(&mut self, config: RuntimeConfig) {
        self.config = config;
    }

    /// Ticks executed so far, across all runs.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Whether the last run stopped at a tick limit with re-entry pending.
    pub fn is_suspended(&self) -> bool {
        self.resume_at.is_some()
    }

    pub fn profile_report(&self) -> Option<ProfileReport> {
        self.config.profile.then(|| self.profiler.report())
    }

    /// Initialize every unit reachable from `start` exactly once, in
    /// topological order, attaching its bound buffers to the device first.
    /// Stops at the first failure.
    pub fn initialize_dependent(&mut self, graph: &mut LinkGraph, start: UnitId) -> Result<usize> {
        let order = graph.topological(start)?;
        let device = self.config.device.clone();
        for &id in &order {
            let node = graph.node_mut(id)?;
            for (_, bound) in node.bindings.iter() {
                bound
                    .buffer
                    .attach(&device)
                    .map_err(|e| e.in_unit(&node.name))?;
            }
            let ctx = InitContext::new(&node.name, &node.bindings, &device);
            node.unit
                .initialize(&ctx)
                .map_err(|e| e.in_unit(&node.name))?;
            debug!("initialized '{}'", node.name);
        }
        info!("initialized {} units on {}", order.len(), device.name());
        Ok(order.len())
    }

    /// Run ticks until quiescence or until `config.max_ticks` is reached.
    pub fn run_dependent(&mut self, graph: &mut LinkGraph, start: UnitId) -> Result<RunReport> {
        self.run_ticks(graph, start, self.config.max_ticks)
    }

    /// Run ticks until quiescence or until `limit` ticks have run.
    pub fn run_ticks(
        &mut self,
        graph: &mut LinkGraph,
        start: UnitId,
        limit: Option<u64>,
    ) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut entry = self.resume_at.take().unwrap_or(start);
        loop {
            if limit.is_some_and(|max| report.ticks >= max) {
                self.resume_at = Some(entry);
                debug!(
                    "suspended after {} ticks; next tick enters at '{}'",
                    report.ticks,
                    graph.name(entry)?
                );
                return Ok(report);
            }
            self.tick += 1;
            report.ticks += 1;
            debug!("tick {} enters at '{}'", self.tick, graph.name(entry)?);
            match self.run_tick(graph, entry, &mut report)? {
                Some(next) => entry = next,
                None => break,
            }
        }
        report.finished = true;
        info!(
            "run finished after {} ticks ({} runs, {} skipped, {} blocked)",
            report.ticks, report.units_run, report.skipped, report.blocked
        );
        Ok(report)
    }

    fn run_tick(
        &mut self,
        graph: &mut LinkGraph,
        entry: UnitId,
        report: &mut RunReport,
    ) -> Result<Option<UnitId>> {
        let mut visit = vec![Visit::Pending; graph.len()];
        let mut arrived = vec![0usize; graph.len()];
        let mut reentry = None;
        // (unit, index of the next successor to hand control to)
        let mut stack: Vec<(UnitId, usize)> = Vec::new();

        if self.open(graph, entry, &mut visit, report)? {
            stack.push((entry, 0));
        }
        while let Some(top) = stack.last_mut() {
            let (id, next) = *top;
            let succ = match graph.links_to(id)?.get(next) {
                Some(&succ) => succ,
                None => {
                    stack.pop();
                    continue;
                }
            };
            top.1 += 1;

            let slot = succ.index();
            if graph.kind(succ)? == UnitKind::Repeater {
                match visit[slot] {
                    Visit::Pending => {}
                    Visit::Done => {
                        if graph.gate_block(succ)?.is_some_and(|g| g.fires()) {
                            report.blocked += 1;
                        } else {
                            reentry = Some(succ);
                        }
                        continue;
                    }
                    Visit::Blocked => continue,
                }
            } else {
                if visit[slot] != Visit::Pending {
                    return Err(Error::CycleWithoutRepeater {
                        unit: graph.name(succ)?.to_string(),
                    });
                }
                arrived[slot] += 1;
                if arrived[slot] < graph.links_from(succ)?.len() {
                    continue;
                }
            }

            if self.open(graph, succ, &mut visit, report)? {
                stack.push((succ, 0));
            }
        }
        Ok(reentry)
    }

    /// Resolve gates and run the unit; returns whether control passes on.
    fn open(
        &mut self,
        graph: &mut LinkGraph,
        id: UnitId,
        visit: &mut [Visit],
        report: &mut RunReport,
    ) -> Result<bool> {
        let node = graph.node_mut(id)?;
        match gate::resolve(node.gate_block.as_ref(), node.gate_skip.as_ref()) {
            GateDecision::Block => {
                visit[id.index()] = Visit::Blocked;
                report.blocked += 1;
                debug!("'{}' blocked", node.name);
                Ok(false)
            }
            GateDecision::Skip => {
                visit[id.index()] = Visit::Done;
                report.skipped += 1;
                debug!("'{}' skipped", node.name);
                Ok(true)
            }
            GateDecision::Run => {
                visit[id.index()] = Visit::Done;
                self.run_unit(node)?;
                report.units_run += 1;
                Ok(true)
            }
        }
    }

    fn run_unit(&mut self, node: &mut Node) -> Result<()> {
        let residency = node.unit.residency();
        for (_, bound) in node.bindings.iter() {
            let fresh = match residency {
                Residency::Host => bound.buffer.sync(),
                Residency::Device => bound.buffer.update(),
            };
            fresh.map_err(|e| e.in_unit(&node.name))?;
            if bound.access.writes() {
                bound
                    .buffer
                    .claim_producer(&node.name, self.tick)
                    .map_err(|e| e.in_unit(&node.name))?;
            }
        }

        let ctx = RunContext::new(&node.name, self.tick);
        let start = Instant::now();
        node.unit.run(&ctx).map_err(|e| e.in_unit(&node.name))?;
        let elapsed = start.elapsed();
        debug!("{} in {:.2?}", node.name, elapsed);
        if self.config.profile {
            self.profiler.record(&node.name, elapsed);
        }
        Ok(())
    }
}
