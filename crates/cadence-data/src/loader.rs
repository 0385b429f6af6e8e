// ClassLoader — serves one minibatch per tick from a class-partitioned dataset
//
// Samples are laid out as three consecutive ranges:
//
//   [0, test)                    test
//   [test, test + validation)    validation
//   [test + validation, total)   train
//
// Each run advances the offset by the previous minibatch size. When the end
// of the data is reached the offset wraps to 0 and the train range is
// reshuffled. The minibatch class is the first class whose range end lies
// beyond the offset, its size is clipped at that end, and `last` is set when
// the minibatch reaches it. Unused rows are zero-filled and their labels and
// indexes set to -1.
//
// The random generator is explicit: seeded from the config or handed in by
// the driver, never a process-wide default.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use cadence_core::{
    Buffer, ClassSamples, Error, InitContext, Minibatch, MinibatchClass, MinibatchState, Result,
    RunContext, Unit,
};

use crate::dataset::{Dataset, Sample};

/// Configuration for the ClassLoader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Maximum number of samples per minibatch.
    pub minibatch_size: usize,
    /// Number of samples in each class; must add up to the dataset size.
    pub class_samples: ClassSamples,
    /// Whether to reshuffle the train range every epoch.
    pub shuffle: bool,
    /// Seed for the loader's generator.
    pub seed: u64,
    /// Gather samples with rayon when non-zero.
    pub num_workers: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            minibatch_size: 100,
            class_samples: ClassSamples::default(),
            shuffle: true,
            seed: 1234,
            num_workers: 0,
        }
    }
}

impl LoaderConfig {
    pub fn minibatch_size(mut self, n: usize) -> Self {
        self.minibatch_size = n;
        self
    }

    pub fn class_samples(mut self, test: usize, validation: usize, train: usize) -> Self {
        self.class_samples = ClassSamples::new(test, validation, train);
        self
    }

    pub fn shuffle(mut self, s: bool) -> Self {
        self.shuffle = s;
        self
    }

    pub fn seed(mut self, s: u64) -> Self {
        self.seed = s;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }
}

/// Loader unit publishing `minibatch_data`, `minibatch_labels`,
/// `minibatch_indexes` and the shared [`Minibatch`] attributes.
pub struct ClassLoader {
    name: String,
    config: LoaderConfig,
    dataset: Box<dyn Dataset>,
    rng: StdRng,
    minibatch: Minibatch,
    data: Buffer,
    labels: Buffer,
    indexes: Buffer,
    shuffled: Vec<usize>,
    offset: usize,
    size: usize,
    passes: u64,
}

impl ClassLoader {
    /// Create a loader whose generator is seeded from `config.seed`.
    pub fn new(dataset: Box<dyn Dataset>, config: LoaderConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self::with_rng(dataset, config, rng)
    }

    /// Create a loader that shuffles with the given generator.
    pub fn with_rng(dataset: Box<dyn Dataset>, config: LoaderConfig, rng: StdRng) -> Self {
        let max = config.minibatch_size;
        let mut data_shape = vec![max];
        data_shape.extend_from_slice(dataset.feature_shape());
        let total = dataset.len();
        Self {
            name: "loader".to_string(),
            data: Buffer::zeros("minibatch_data", data_shape),
            labels: Buffer::zeros("minibatch_labels", [max]),
            indexes: Buffer::zeros("minibatch_indexes", [max]),
            config,
            dataset,
            rng,
            minibatch: Minibatch::new(),
            shuffled: Vec::new(),
            offset: total,
            size: 0,
            passes: 0,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn class_samples(&self) -> ClassSamples {
        self.config.class_samples
    }

    /// Shared handle onto the attributes of the current minibatch.
    pub fn minibatch(&self) -> Minibatch {
        self.minibatch.clone()
    }

    pub fn data(&self) -> Buffer {
        self.data.clone()
    }

    pub fn labels(&self) -> Buffer {
        self.labels.clone()
    }

    pub fn indexes(&self) -> Buffer {
        self.indexes.clone()
    }

    pub fn num_labels(&self) -> usize {
        self.dataset.num_labels()
    }

    /// How many times the loader has wrapped around to the start of the data.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Dataset position of every sample, in serving order.
    pub fn order(&self) -> &[usize] {
        &self.shuffled
    }

    fn shuffle_range(&mut self, start: usize, end: usize) {
        if self.config.shuffle && end > start {
            self.shuffled[start..end].shuffle(&mut self.rng);
        }
    }

    fn classify(&self, offset: usize) -> Result<(MinibatchClass, usize)> {
        let ends = self.config.class_samples.end_offsets();
        MinibatchClass::ALL
            .into_iter()
            .zip(ends)
            .find(|(_, end)| offset < *end)
            .ok_or(Error::UnclassifiedMinibatch {
                offset,
                total: self.dataset.len(),
            })
    }

    fn fetch(&self, indices: &[usize]) -> Vec<Sample> {
        let dataset = &*self.dataset;
        if self.config.num_workers > 0 && indices.len() > 1 {
            indices.par_iter().map(|&i| dataset.get(i)).collect()
        } else {
            indices.iter().map(|&i| dataset.get(i)).collect()
        }
    }

    fn fill(&self, indices: &[usize], samples: &[Sample]) -> Result<()> {
        let per_sample: usize = self.dataset.feature_shape().iter().product();
        let size = samples.len();

        let mut data = self.data.write()?;
        for (row, sample) in samples.iter().enumerate() {
            if sample.features.len() != per_sample {
                return Err(Error::ShapeMismatch {
                    name: format!("sample {}", indices[row]),
                    expected: self.dataset.feature_shape().to_vec(),
                    got: vec![sample.features.len()],
                });
            }
            data[row * per_sample..(row + 1) * per_sample].copy_from_slice(&sample.features);
        }
        data[size * per_sample..].fill(0.0);
        drop(data);

        let mut labels = self.labels.write()?;
        for (slot, sample) in labels.iter_mut().zip(samples) {
            *slot = sample.label as f64;
        }
        labels[size..].fill(-1.0);
        drop(labels);

        let mut indexes = self.indexes.write()?;
        for (slot, &index) in indexes.iter_mut().zip(indices) {
            *slot = index as f64;
        }
        indexes[size..].fill(-1.0);
        Ok(())
    }
}

impl Unit for ClassLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, _ctx: &InitContext<'_>) -> Result<()> {
        let total = self.dataset.len();
        if self.config.minibatch_size == 0 {
            return Err(Error::msg("minibatch_size must be positive"));
        }
        let sum = self.config.class_samples.total();
        if sum != total {
            return Err(Error::ClassSamplesMismatch { sum, total });
        }
        if self.config.class_samples.train == 0 {
            return Err(Error::EmptyClass {
                class: MinibatchClass::Train.to_string(),
            });
        }
        if self.shuffled.len() == total {
            // Already laid out; keep the current position across rewiring.
            return Ok(());
        }

        self.shuffled = (0..total).collect();
        let [test_end, validation_end, _] = self.config.class_samples.end_offsets();
        if self.config.class_samples.test > 0 {
            // Draw the validation split at random out of validation + train.
            self.shuffle_range(test_end, total);
        } else {
            self.shuffle_range(validation_end, total);
        }
        self.offset = total;
        self.size = 0;
        log::info!(
            "{}: {} samples (test {}, validation {}, train {}), minibatch {}",
            self.name,
            total,
            self.config.class_samples.test,
            self.config.class_samples.validation,
            self.config.class_samples.train,
            self.config.minibatch_size
        );
        Ok(())
    }

    fn run(&mut self, _ctx: &RunContext<'_>) -> Result<()> {
        let total = self.dataset.len();
        self.offset += self.size;
        if self.offset >= total {
            let train_start = self
                .config
                .class_samples
                .start_offset(MinibatchClass::Train);
            self.shuffle_range(train_start, total);
            self.offset = 0;
            self.passes += 1;
        }

        let (class, end) = self.classify(self.offset)?;
        let size = self.config.minibatch_size.min(end - self.offset);
        let last = self.offset + size >= end;
        self.size = size;

        let indices = self.shuffled[self.offset..self.offset + size].to_vec();
        let samples = self.fetch(&indices);
        self.fill(&indices, &samples)?;

        self.minibatch.set(MinibatchState {
            class,
            last,
            size,
            offset: self.offset,
        });
        Ok(())
    }
}
