/// All errors that can occur while wiring, initializing or running a workflow.
///
/// The variants follow the three failure families of the engine:
/// configuration errors (detected at `initialize`, before any tick),
/// data errors (detected at the tick that discovers them) and
/// accelerator errors (a synchronization call failing). None of them is
/// retried inside the engine; they all travel up to the driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A buffer or minibatch does not have the expected shape.
    #[error("shape mismatch for '{name}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A unit requires a buffer binding that was never wired.
    #[error("unit '{unit}' requires binding '{binding}', which is not wired")]
    MissingBinding { unit: String, binding: String },

    /// Per-class sample counts do not add up to the dataset size.
    #[error("sum of class samples ({sum}) differs from total number of samples ({total})")]
    ClassSamplesMismatch { sum: usize, total: usize },

    /// A unit id that does not belong to this graph.
    #[error("unknown unit id {0}")]
    UnknownUnit(usize),

    /// A control edge that cannot be created (e.g. a self-link).
    #[error("invalid link: {0}")]
    InvalidLink(String),

    /// A plain unit was reached twice in one tick; only a Repeater may close a cycle.
    #[error("unit '{unit}' was re-entered within one tick; cycles must pass through a Repeater")]
    CycleWithoutRepeater { unit: String },

    /// The loader could not place the minibatch offset in any class range.
    #[error("could not determine minibatch class for offset {offset} (total samples {total})")]
    UnclassifiedMinibatch { offset: usize, total: usize },

    /// A minibatch was reported for a class that has no samples.
    #[error("minibatch reported for class '{class}', which has no samples")]
    EmptyClass { class: String },

    /// An evaluator reported an error count that no pass over the class can
    /// produce (negative, not finite, or more errors than samples).
    #[error("error count {count} for class '{class}' is outside 0..={samples}")]
    ErrorCountOutOfRange {
        class: String,
        count: f64,
        samples: usize,
    },

    /// The accelerator failed to move data between host and device.
    #[error("device sync failed for buffer '{buffer}' on {device}: {reason}")]
    DeviceSync {
        buffer: String,
        device: String,
        reason: String,
    },

    /// The host view was read while the device mirror holds unsynced writes.
    #[error("buffer '{0}' read on host while device holds newer data (missing sync)")]
    StaleHost(String),

    /// The device mirror was consumed while the host holds unpushed writes.
    #[error("buffer '{0}' used on device while host holds newer data (missing update)")]
    StaleDevice(String),

    /// Two units claimed to produce the same buffer within one tick.
    #[error("buffer '{buffer}' produced by both '{first}' and '{second}' in tick {tick}")]
    ProducerConflict {
        buffer: String,
        first: String,
        second: String,
        tick: u64,
    },

    /// Error raised by a unit, annotated with the unit's name.
    #[error("unit '{unit}': {source}")]
    Unit {
        unit: String,
        #[source]
        source: Box<Error>,
    },

    /// Snapshot or checkpoint file IO failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Wrap this error with the name of the unit that raised it.
    ///
    /// Already-wrapped errors are returned unchanged so the innermost unit
    /// name is the one reported.
    pub fn in_unit(self, unit: impl Into<String>) -> Self {
        match self {
            e @ Error::Unit { .. } => e,
            other => Error::Unit {
                unit: unit.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, with any unit annotations stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Unit { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Convenience Result type used throughout cadence.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
