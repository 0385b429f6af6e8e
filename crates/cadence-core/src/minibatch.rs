use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// The partition a minibatch belongs to. Samples are laid out in this order:
/// test first, then validation, then train.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MinibatchClass {
    Test,
    Validation,
    Train,
}

impl MinibatchClass {
    pub const ALL: [MinibatchClass; 3] = [
        MinibatchClass::Test,
        MinibatchClass::Validation,
        MinibatchClass::Train,
    ];

    pub fn index(self) -> usize {
        match self {
            MinibatchClass::Test => 0,
            MinibatchClass::Validation => 1,
            MinibatchClass::Train => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MinibatchClass::Test => "test",
            MinibatchClass::Validation => "validation",
            MinibatchClass::Train => "train",
        }
    }
}

impl fmt::Display for MinibatchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of samples in each class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassSamples {
    pub test: usize,
    pub validation: usize,
    pub train: usize,
}

impl ClassSamples {
    pub fn new(test: usize, validation: usize, train: usize) -> Self {
        Self {
            test,
            validation,
            train,
        }
    }

    pub fn get(&self, class: MinibatchClass) -> usize {
        match class {
            MinibatchClass::Test => self.test,
            MinibatchClass::Validation => self.validation,
            MinibatchClass::Train => self.train,
        }
    }

    pub fn total(&self) -> usize {
        self.test + self.validation + self.train
    }

    /// Offset one past the last sample of each class.
    pub fn end_offsets(&self) -> [usize; 3] {
        [
            self.test,
            self.test + self.validation,
            self.test + self.validation + self.train,
        ]
    }

    /// Offset of the first sample of `class`.
    pub fn start_offset(&self, class: MinibatchClass) -> usize {
        match class {
            MinibatchClass::Test => 0,
            MinibatchClass::Validation => self.test,
            MinibatchClass::Train => self.test + self.validation,
        }
    }

    /// The class whose error drives snapshots and stopping: validation when
    /// it has samples, train otherwise.
    pub fn evaluation_class(&self) -> MinibatchClass {
        if self.validation > 0 {
            MinibatchClass::Validation
        } else {
            MinibatchClass::Train
        }
    }
}

/// What the loader published for the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinibatchState {
    pub class: MinibatchClass,
    /// Whether this minibatch is the last one of its class in this epoch.
    pub last: bool,
    /// Number of valid samples in the minibatch.
    pub size: usize,
    /// Offset of the first sample in the global test/validation/train layout.
    pub offset: usize,
}

impl Default for MinibatchState {
    fn default() -> Self {
        Self {
            class: MinibatchClass::Train,
            last: false,
            size: 0,
            offset: 0,
        }
    }
}

/// Shared handle onto the loader's current minibatch attributes.
///
/// The loader is the only writer; Decision, evaluators and gradient units
/// read it.
#[derive(Debug, Clone, Default)]
pub struct Minibatch {
    inner: Arc<RwLock<MinibatchState>>,
}

impl Minibatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> MinibatchState {
        *self.inner.read()
    }

    pub fn set(&self, state: MinibatchState) {
        *self.inner.write() = state;
    }

    pub fn class(&self) -> MinibatchClass {
        self.inner.read().class
    }

    pub fn is_last(&self) -> bool {
        self.inner.read().last
    }

    pub fn size(&self) -> usize {
        self.inner.read().size
    }

    pub fn same(&self, other: &Minibatch) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
