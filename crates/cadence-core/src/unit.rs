// Unit — The node type of a workflow graph
//
// A unit is a named, stateful step: a loader, a numeric kernel, a decision, a
// plotter. The graph owns every unit (arena storage, addressed by UnitId) and
// decides when it runs; the unit only implements what happens when it does.
//
// Buffers reach a unit through named bindings set up while wiring. A binding
// is resolved once, in `initialize`, through InitContext:
//
//   require("input")   → Buffer or MissingBinding error
//   optional("target") → Binding::Present(buffer) | Binding::Absent
//
// The unit keeps the resolved handles and never looks bindings up again in
// `run`.

use std::any::Any;
use std::collections::BTreeMap;

use crate::buffer::Buffer;
use crate::device::{DeviceRef, Residency};
use crate::error::{Error, Result};

/// Type-erased access to a unit, used to hand typed references back to the
/// code that built the graph.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Scheduling role of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Runs once all of its predecessors completed (or skipped) this tick.
    Plain,
    /// Opens on any predecessor; reaching it again within a tick schedules
    /// the next tick.
    Repeater,
    /// Terminal sentinel; its run releases the workflow's waiters.
    EndPoint,
}

/// How a unit uses a bound buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// A buffer bound to a unit under some name.
#[derive(Debug, Clone)]
pub struct Bound {
    pub buffer: Buffer,
    pub access: Access,
}

/// The named buffer bindings of one unit.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    map: BTreeMap<String, Bound>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `buffer` under `name`, returning the binding it replaced.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        buffer: Buffer,
        access: Access,
    ) -> Option<Bound> {
        self.map.insert(name.into(), Bound { buffer, access })
    }

    pub fn remove(&mut self, name: &str) -> Option<Bound> {
        self.map.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Bound> {
        self.map.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bound)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// An optional binding, resolved once at initialize time.
#[derive(Debug, Clone, Default)]
pub enum Binding {
    Present(Buffer),
    #[default]
    Absent,
}

impl Binding {
    pub fn is_present(&self) -> bool {
        matches!(self, Binding::Present(_))
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        match self {
            Binding::Present(b) => Some(b),
            Binding::Absent => None,
        }
    }
}

/// What a unit sees while it is being initialized.
pub struct InitContext<'a> {
    unit: &'a str,
    bindings: &'a Bindings,
    device: &'a DeviceRef,
}

impl<'a> InitContext<'a> {
    pub fn new(unit: &'a str, bindings: &'a Bindings, device: &'a DeviceRef) -> Self {
        Self {
            unit,
            bindings,
            device,
        }
    }

    /// Resolve a binding the unit cannot work without.
    pub fn require(&self, name: &str) -> Result<Buffer> {
        self.bindings
            .get(name)
            .map(|b| b.buffer.clone())
            .ok_or_else(|| Error::MissingBinding {
                unit: self.unit.to_string(),
                binding: name.to_string(),
            })
    }

    /// Resolve a binding the unit can do without.
    pub fn optional(&self, name: &str) -> Binding {
        match self.bindings.get(name) {
            Some(b) => Binding::Present(b.buffer.clone()),
            None => Binding::Absent,
        }
    }

    pub fn device(&self) -> &DeviceRef {
        self.device
    }

    pub fn unit_name(&self) -> &str {
        self.unit
    }
}

/// What a unit sees while it runs.
pub struct RunContext<'a> {
    unit: &'a str,
    tick: u64,
}

impl<'a> RunContext<'a> {
    pub fn new(unit: &'a str, tick: u64) -> Self {
        Self { unit, tick }
    }

    /// The tick being executed, starting at 1.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn unit_name(&self) -> &str {
        self.unit
    }
}

/// A graph node.
///
/// `initialize` may be called again after the graph is rewired and must
/// keep the unit's accumulated state.
pub trait Unit: AsAny + Send {
    fn name(&self) -> &str;

    fn kind(&self) -> UnitKind {
        UnitKind::Plain
    }

    fn residency(&self) -> Residency {
        Residency::Host
    }

    fn initialize(&mut self, ctx: &InitContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn run(&mut self, ctx: &RunContext<'_>) -> Result<()>;
}

/// Downcast a unit to its concrete type.
pub fn downcast_ref<T: Unit>(unit: &dyn Unit) -> Option<&T> {
    unit.as_any().downcast_ref::<T>()
}

/// Downcast a unit to its concrete type, mutably.
pub fn downcast_mut<T: Unit>(unit: &mut dyn Unit) -> Option<&mut T> {
    unit.as_any_mut().downcast_mut::<T>()
}
