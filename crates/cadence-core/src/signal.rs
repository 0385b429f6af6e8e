// Signal — Single-writer, multi-reader boolean cells used as unit gates
//
// A gate cell is set by one unit (usually Decision) and read by the scheduler
// right before it runs the gated unit. Signal is the writer half and is not
// Clone; SignalRef is the reader half and can be handed out freely. A driver
// that must force a stop (operator interrupt) owns the writer of the gate it
// intends to trip.
//
// Constant cells model fixed gates ("always block", "never skip").

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Writer half of a boolean gate cell.
pub struct Signal {
    name: Arc<str>,
    cell: Arc<AtomicBool>,
}

impl Signal {
    pub fn new(name: &str, initial: bool) -> Self {
        Self {
            name: Arc::from(name),
            cell: Arc::new(AtomicBool::new(initial)),
        }
    }

    pub fn set(&self, value: bool) {
        self.cell.store(value, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.cell.load(Ordering::Acquire)
    }

    /// Set to true and keep it there; returns whether this call flipped it.
    pub fn latch(&self) -> bool {
        !self.cell.swap(true, Ordering::AcqRel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A reader handle onto this cell.
    pub fn reader(&self) -> SignalRef {
        SignalRef {
            name: Arc::clone(&self.name),
            source: Source::Cell(Arc::clone(&self.cell)),
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({}={})", self.name, self.get())
    }
}

#[derive(Clone)]
enum Source {
    Cell(Arc<AtomicBool>),
    Constant(bool),
}

/// Reader half of a gate cell.
#[derive(Clone)]
pub struct SignalRef {
    name: Arc<str>,
    source: Source,
}

impl SignalRef {
    /// A cell that always reads `value`.
    pub fn constant(value: bool) -> Self {
        Self {
            name: Arc::from(if value { "true" } else { "false" }),
            source: Source::Constant(value),
        }
    }

    pub fn get(&self) -> bool {
        match &self.source {
            Source::Cell(cell) => cell.load(Ordering::Acquire),
            Source::Constant(v) => *v,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether both handles read the same cell.
    pub fn same(&self, other: &SignalRef) -> bool {
        match (&self.source, &other.source) {
            (Source::Cell(a), Source::Cell(b)) => Arc::ptr_eq(a, b),
            (Source::Constant(a), Source::Constant(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for SignalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalRef({}={})", self.name, self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_reports_first_flip_only() {
        let s = Signal::new("complete", false);
        assert!(s.latch());
        assert!(!s.latch());
        assert!(s.reader().get());
    }
}
