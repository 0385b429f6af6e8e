// LinkGraph — Arena of units and the control edges between them
//
// Units live in a Vec and are addressed by UnitId, an index into it. Edges
// are kept on both ends:
//
//   links_from[u]  ordered predecessors of u (its join set)
//   links_to[u]    ordered successors of u (visit order within a tick)
//
// Unlinking removes edges only; the unit stays in the arena with its state,
// gates and bindings, ready to be linked back in. Ids are never reused.

use std::fmt;

use cadence_core::unit::{downcast_mut, downcast_ref};
use cadence_core::{Access, Bindings, Bound, Buffer, Error, Result, Unit, UnitKind};

use super::gate::Gate;

/// Index of a unit in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(usize);

impl UnitId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub(crate) struct Node {
    pub(crate) unit: Box<dyn Unit>,
    pub(crate) name: String,
    pub(crate) kind: UnitKind,
    pub(crate) links_from: Vec<UnitId>,
    pub(crate) links_to: Vec<UnitId>,
    pub(crate) gate_block: Option<Gate>,
    pub(crate) gate_skip: Option<Gate>,
    pub(crate) bindings: Bindings,
}

impl Node {
    fn new(unit: Box<dyn Unit>) -> Self {
        Self {
            name: unit.name().to_string(),
            kind: unit.kind(),
            unit,
            links_from: Vec::new(),
            links_to: Vec::new(),
            gate_block: None,
            gate_skip: None,
            bindings: Bindings::new(),
        }
    }
}

/// Mutable directed graph over units.
#[derive(Default)]
pub struct LinkGraph {
    nodes: Vec<Node>,
}

impl LinkGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// A graph holding `head → next` and nothing else.
    pub fn with_edge(head: Box<dyn Unit>, next: Box<dyn Unit>) -> (Self, UnitId, UnitId) {
        let (h, n) = (UnitId(0), UnitId(1));
        let mut head = Node::new(head);
        let mut next = Node::new(next);
        head.links_to.push(n);
        next.links_from.push(h);
        let graph = Self {
            nodes: vec![head, next],
        };
        (graph, h, n)
    }

    /// Move a unit into the arena.
    pub fn add(&mut self, unit: Box<dyn Unit>) -> UnitId {
        let id = UnitId(self.nodes.len());
        self.nodes.push(Node::new(unit));
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = UnitId> {
        (0..self.nodes.len()).map(UnitId)
    }

    pub(crate) fn node(&self, id: UnitId) -> Result<&Node> {
        self.nodes.get(id.0).ok_or(Error::UnknownUnit(id.0))
    }

    pub(crate) fn node_mut(&mut self, id: UnitId) -> Result<&mut Node> {
        self.nodes.get_mut(id.0).ok_or(Error::UnknownUnit(id.0))
    }

    pub fn name(&self, id: UnitId) -> Result<&str> {
        Ok(&self.node(id)?.name)
    }

    pub fn kind(&self, id: UnitId) -> Result<UnitKind> {
        Ok(self.node(id)?.kind)
    }

    /// First unit with the given name.
    pub fn find(&self, name: &str) -> Option<UnitId> {
        self.nodes.iter().position(|n| n.name == name).map(UnitId)
    }

    pub fn unit(&self, id: UnitId) -> Result<&dyn Unit> {
        Ok(&*self.node(id)?.unit)
    }

    pub fn unit_mut(&mut self, id: UnitId) -> Result<&mut dyn Unit> {
        Ok(&mut *self.node_mut(id)?.unit)
    }

    /// Typed access to a unit.
    pub fn get<T: Unit>(&self, id: UnitId) -> Result<&T> {
        let node = self.node(id)?;
        downcast_ref::<T>(&*node.unit).ok_or_else(|| {
            Error::msg(format!(
                "unit '{}' is not a {}",
                node.name,
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn get_mut<T: Unit>(&mut self, id: UnitId) -> Result<&mut T> {
        let node = self.node_mut(id)?;
        let name = node.name.clone();
        downcast_mut::<T>(&mut *node.unit).ok_or_else(|| {
            Error::msg(format!(
                "unit '{}' is not a {}",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    // Edges

    /// Make `id` depend on each of `preds`. Existing edges are kept once.
    pub fn link_from(&mut self, id: UnitId, preds: &[UnitId]) -> Result<()> {
        self.node(id)?;
        for &pred in preds {
            self.node(pred)?;
            if pred == id {
                return Err(Error::InvalidLink(format!(
                    "unit '{}' cannot depend on itself",
                    self.nodes[id.0].name
                )));
            }
        }
        for &pred in preds {
            if !self.nodes[id.0].links_from.contains(&pred) {
                self.nodes[id.0].links_from.push(pred);
                self.nodes[pred.0].links_to.push(id);
            }
        }
        Ok(())
    }

    /// Remove the single edge `pred → id`; returns whether it existed.
    pub fn unlink_from(&mut self, id: UnitId, pred: UnitId) -> Result<bool> {
        self.node(id)?;
        self.node(pred)?;
        let node = &mut self.nodes[id.0];
        let before = node.links_from.len();
        node.links_from.retain(|&p| p != pred);
        let existed = node.links_from.len() != before;
        self.nodes[pred.0].links_to.retain(|&s| s != id);
        Ok(existed)
    }

    /// Detach `id` from all its predecessors and successors.
    pub fn unlink(&mut self, id: UnitId) -> Result<()> {
        let node = self.node_mut(id)?;
        let preds = std::mem::take(&mut node.links_from);
        let succs = std::mem::take(&mut node.links_to);
        for p in preds {
            self.nodes[p.0].links_to.retain(|&s| s != id);
        }
        for s in succs {
            self.nodes[s.0].links_from.retain(|&p| p != id);
        }
        Ok(())
    }

    pub fn links_from(&self, id: UnitId) -> Result<&[UnitId]> {
        Ok(&self.node(id)?.links_from)
    }

    pub fn links_to(&self, id: UnitId) -> Result<&[UnitId]> {
        Ok(&self.node(id)?.links_to)
    }

    // Gates

    pub fn set_gate_block(&mut self, id: UnitId, gate: Option<Gate>) -> Result<()> {
        self.node_mut(id)?.gate_block = gate;
        Ok(())
    }

    pub fn set_gate_skip(&mut self, id: UnitId, gate: Option<Gate>) -> Result<()> {
        self.node_mut(id)?.gate_skip = gate;
        Ok(())
    }

    pub fn gate_block(&self, id: UnitId) -> Result<Option<&Gate>> {
        Ok(self.node(id)?.gate_block.as_ref())
    }

    pub fn gate_skip(&self, id: UnitId) -> Result<Option<&Gate>> {
        Ok(self.node(id)?.gate_skip.as_ref())
    }

    // Bindings

    /// Bind `buffer` to unit `id` under `name`, returning the replaced binding.
    pub fn bind(
        &mut self,
        id: UnitId,
        name: &str,
        buffer: &Buffer,
        access: Access,
    ) -> Result<Option<Bound>> {
        Ok(self
            .node_mut(id)?
            .bindings
            .insert(name, buffer.clone(), access))
    }

    pub fn unbind(&mut self, id: UnitId, name: &str) -> Result<Option<Bound>> {
        Ok(self.node_mut(id)?.bindings.remove(name))
    }

    pub fn bindings(&self, id: UnitId) -> Result<&Bindings> {
        Ok(&self.node(id)?.bindings)
    }

    /// Every unit reachable from `start` along control edges, each exactly
    /// once.
    pub fn reachable(&self, start: UnitId) -> Result<Vec<UnitId>> {
        self.node(start)?;
        let mut seen = vec![false; self.nodes.len()];
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if seen[id.0] {
                continue;
            }
            seen[id.0] = true;
            order.push(id);
            // Reverse so the first successor is visited first.
            for &succ in self.nodes[id.0].links_to.iter().rev() {
                if !seen[succ.0] {
                    stack.push(succ);
                }
            }
        }
        Ok(order)
    }

    /// Units reachable from `start` in topological order: every unit comes
    /// after all of its reachable predecessors. A Repeater only waits for its
    /// first one, which breaks the loop edges closing back into it.
    ///
    /// A cycle that does not pass through a Repeater leaves its units
    /// unordered and is reported as `CycleWithoutRepeater`.
    pub fn topological(&self, start: UnitId) -> Result<Vec<UnitId>> {
        let reachable = self.reachable(start)?;
        let mut inside = vec![false; self.nodes.len()];
        for id in &reachable {
            inside[id.0] = true;
        }

        // Remaining predecessors before each unit is ready.
        let mut waiting = vec![0usize; self.nodes.len()];
        for &id in &reachable {
            let node = &self.nodes[id.0];
            let preds = node.links_from.iter().filter(|p| inside[p.0]).count();
            waiting[id.0] = match node.kind {
                UnitKind::Repeater => preds.min(1),
                _ => preds,
            };
        }
        waiting[start.0] = 0;

        let mut order = Vec::with_capacity(reachable.len());
        let mut placed = vec![false; self.nodes.len()];
        let mut ready = std::collections::VecDeque::from([start]);
        while let Some(id) = ready.pop_front() {
            if placed[id.0] {
                continue;
            }
            placed[id.0] = true;
            order.push(id);
            for &succ in &self.nodes[id.0].links_to {
                if placed[succ.0] || waiting[succ.0] == 0 {
                    continue;
                }
                waiting[succ.0] -= 1;
                if waiting[succ.0] == 0 {
                    ready.push_back(succ);
                }
            }
        }

        match reachable.iter().find(|id| !placed[id.0]) {
            Some(&stuck) => Err(Error::CycleWithoutRepeater {
                unit: self.nodes[stuck.0].name.clone(),
            }),
            None => Ok(order),
        }
    }
}

impl fmt::Debug for LinkGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (i, n) in self.nodes.iter().enumerate() {
            list.entry(&format_args!(
                "{} {} {:?} <- {:?}",
                UnitId(i),
                n.name,
                n.kind,
                n.links_from
            ));
        }
        list.finish()
    }
}
