// Workflow — a LinkGraph with its lifecycle units and a scheduler
//
// A new workflow already holds start_point → repeater and a detached
// end_point. The caller adds the loop body, links it between the repeater
// and back, gates the end point and the loader on the decision's `complete`
// signal, then drives it:
//
//   let mut wf = Workflow::new("mnist");
//   let loader = wf.add(loader);
//   wf.link_from(loader, &[wf.repeater()])?;
//   ...
//   wf.initialize(RuntimeConfig::default())?;
//   wf.run()?;
//
// Graph mutation (unlink, link_from, bind) is allowed between runs. A run
// suspended by a tick limit resumes at the repeater on the next call.

use cadence_core::{Access, Buffer, Error, Result, Unit};

use crate::exec::{
    Completion, EndPoint, Gate, LinkGraph, Repeater, RunReport, RuntimeConfig, Scheduler,
    StartPoint, UnitId,
};
use crate::profiler::ProfileReport;

pub struct Workflow {
    name: String,
    graph: LinkGraph,
    start: UnitId,
    repeater: UnitId,
    end: UnitId,
    completion: Completion,
    scheduler: Option<Scheduler>,
}

impl Workflow {
    pub fn new(name: &str) -> Self {
        let completion = Completion::new();
        let (mut graph, start, repeater) =
            LinkGraph::with_edge(Box::new(StartPoint), Box::new(Repeater));
        let end = graph.add(Box::new(EndPoint::new(completion.clone())));
        Self {
            name: name.to_string(),
            graph,
            start,
            repeater,
            end,
            completion,
            scheduler: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_point(&self) -> UnitId {
        self.start
    }

    pub fn repeater(&self) -> UnitId {
        self.repeater
    }

    pub fn end_point(&self) -> UnitId {
        self.end
    }

    pub fn graph(&self) -> &LinkGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut LinkGraph {
        &mut self.graph
    }

    // Wiring

    pub fn add<U: Unit>(&mut self, unit: U) -> UnitId {
        self.graph.add(Box::new(unit))
    }

    pub fn link_from(&mut self, id: UnitId, preds: &[UnitId]) -> Result<()> {
        self.graph.link_from(id, preds)
    }

    pub fn unlink(&mut self, id: UnitId) -> Result<()> {
        self.graph.unlink(id)
    }

    pub fn unlink_from(&mut self, id: UnitId, pred: UnitId) -> Result<bool> {
        self.graph.unlink_from(id, pred)
    }

    pub fn bind(&mut self, id: UnitId, name: &str, buffer: &Buffer, access: Access) -> Result<()> {
        self.graph.bind(id, name, buffer, access)?;
        Ok(())
    }

    pub fn set_gate_block(&mut self, id: UnitId, gate: Gate) -> Result<()> {
        self.graph.set_gate_block(id, Some(gate))
    }

    pub fn set_gate_skip(&mut self, id: UnitId, gate: Gate) -> Result<()> {
        self.graph.set_gate_skip(id, Some(gate))
    }

    pub fn clear_gates(&mut self, id: UnitId) -> Result<()> {
        self.graph.set_gate_block(id, None)?;
        self.graph.set_gate_skip(id, None)
    }

    pub fn unit<T: Unit>(&self, id: UnitId) -> Result<&T> {
        self.graph.get(id)
    }

    pub fn unit_mut<T: Unit>(&mut self, id: UnitId) -> Result<&mut T> {
        self.graph.get_mut(id)
    }

    // Lifecycle

    /// Initialize every unit reachable from the start point. May be called
    /// again after rewiring; the tick counter and resume point are kept.
    pub fn initialize(&mut self, config: RuntimeConfig) -> Result<()> {
        let scheduler = match self.scheduler.take() {
            Some(mut s) => {
                s.reconfigure(config);
                s
            }
            None => Scheduler::new(config),
        };
        let scheduler = self.scheduler.insert(scheduler);
        scheduler.initialize_dependent(&mut self.graph, self.start)?;
        Ok(())
    }

    /// Run until the graph quiesces or the configured tick limit is hit.
    pub fn run(&mut self) -> Result<RunReport> {
        self.drive(None)
    }

    /// Run at most `ticks` ticks.
    pub fn run_for(&mut self, ticks: u64) -> Result<RunReport> {
        self.drive(Some(ticks))
    }

    fn drive(&mut self, limit: Option<u64>) -> Result<RunReport> {
        let scheduler = self.scheduler.as_mut().ok_or_else(|| {
            Error::msg(format!(
                "workflow '{}' must be initialized before run",
                self.name
            ))
        })?;
        if !scheduler.is_suspended() {
            self.completion.reset();
        }
        let limit = limit.or(scheduler.config().max_ticks);
        let result = scheduler.run_ticks(&mut self.graph, self.start, limit);
        match &result {
            Ok(report) if !report.finished => {}
            _ => self.completion.release(),
        }
        result
    }

    /// Whether the last run stopped at a tick limit.
    pub fn is_suspended(&self) -> bool {
        self.scheduler.as_ref().is_some_and(Scheduler::is_suspended)
    }

    pub fn ticks(&self) -> u64 {
        self.scheduler.as_ref().map_or(0, Scheduler::tick)
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Block until the current run has finished.
    pub fn wait(&self) {
        self.completion.wait();
    }

    pub fn profile_report(&self) -> Option<ProfileReport> {
        self.scheduler.as_ref().and_then(Scheduler::profile_report)
    }
}
