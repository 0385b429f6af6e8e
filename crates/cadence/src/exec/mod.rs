// =============================================================================
// Exec — The unit graph and the tick scheduler that walks it
// =============================================================================
//
// A workflow is a LinkGraph of units. Control edges say which unit may run
// after which; buffers bound to units carry the data. The Scheduler walks the
// graph once per tick from the start point, and a Repeater closes the training
// cycle so the walk begins again until the loop's gates stop it:
//
//   start_point → repeater → loader → forward → evaluator → decision → gd
//                    ↑                                         │        │
//                    └─────────────────────────────────────────┼────────┘
//                                                              └→ end_point
//
// USAGE:
//   let mut graph = LinkGraph::new();
//   let start = graph.add(Box::new(StartPoint));
//   let rep = graph.add(Box::new(Repeater));
//   graph.link_from(rep, &[start])?;
//   ...
//   let mut sched = Scheduler::new(RuntimeConfig::default());
//   sched.initialize_dependent(&mut graph, start)?;
//   let report = sched.run_dependent(&mut graph, start)?;

mod engine;
pub mod gate;
mod graph;
mod units;

pub use engine::{RunReport, RuntimeConfig, Scheduler};
pub use gate::{resolve, Gate, GateDecision};
pub use graph::{LinkGraph, UnitId};
pub use units::{Completion, EndPoint, Repeater, StartPoint};
