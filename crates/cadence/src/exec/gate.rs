// Gate — per-unit block/skip conditions read right before a unit runs
//
// A gate is a reference to a boolean cell plus a negate flag. It fires when
// the cell's value differs from the flag:
//
//   cell  negate  fires
//   false false   no
//   true  false   yes
//   false true    yes
//   true  true    no
//
// Each unit may carry a block gate and a skip gate. Block wins over skip:
//
//   block fires             → Block (unit and everything after it not visited)
//   skip fires, block not   → Skip  (body not run, successors still reached)
//   neither                 → Run

use std::fmt;

use cadence_core::{Signal, SignalRef};

/// A boolean gate condition.
#[derive(Clone)]
pub struct Gate {
    cell: SignalRef,
    negate: bool,
}

impl Gate {
    /// Fires while the cell is true.
    pub fn on(cell: SignalRef) -> Self {
        Self {
            cell,
            negate: false,
        }
    }

    /// Fires while the cell is false.
    pub fn unless(cell: SignalRef) -> Self {
        Self { cell, negate: true }
    }

    /// A gate that always (or never) fires.
    pub fn constant(fires: bool) -> Self {
        Self::on(SignalRef::constant(fires))
    }

    pub fn fires(&self) -> bool {
        self.cell.get() != self.negate
    }

    pub fn is_negated(&self) -> bool {
        self.negate
    }

    pub fn cell(&self) -> &SignalRef {
        &self.cell
    }

    /// The same cell with the opposite polarity.
    pub fn inverted(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            negate: !self.negate,
        }
    }
}

impl From<SignalRef> for Gate {
    fn from(cell: SignalRef) -> Self {
        Gate::on(cell)
    }
}

impl From<&Signal> for Gate {
    fn from(signal: &Signal) -> Self {
        Gate::on(signal.reader())
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let not = if self.negate { "!" } else { "" };
        write!(f, "Gate({not}{})", self.cell.name())
    }
}

/// What the scheduler does with a unit this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Run,
    Skip,
    Block,
}

/// Combine a unit's block and skip gates.
pub fn resolve(block: Option<&Gate>, skip: Option<&Gate>) -> GateDecision {
    if block.is_some_and(Gate::fires) {
        GateDecision::Block
    } else if skip.is_some_and(Gate::fires) {
        GateDecision::Skip
    } else {
        GateDecision::Run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truth_table() {
        let s = Signal::new("c", false);
        let on = Gate::on(s.reader());
        let off = Gate::unless(s.reader());
        assert!(!on.fires());
        assert!(off.fires());
        s.set(true);
        assert!(on.fires());
        assert!(!off.fires());
        assert!(!on.inverted().fires());
    }

    #[test]
    fn block_wins() {
        let yes = Gate::constant(true);
        let no = Gate::constant(false);
        assert_eq!(resolve(Some(&yes), Some(&yes)), GateDecision::Block);
        assert_eq!(resolve(Some(&no), Some(&yes)), GateDecision::Skip);
        assert_eq!(resolve(None, Some(&no)), GateDecision::Run);
        assert_eq!(resolve(None, None), GateDecision::Run);
    }
}
