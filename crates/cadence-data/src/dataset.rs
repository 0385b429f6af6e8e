// Dataset — indexed sample sources the loader draws minibatches from

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cadence_core::{Error, Result};

/// A single sample: flattened input features and the integer label.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Input feature vector (flattened).
    pub features: Vec<f64>,
    /// Class label of the sample.
    pub label: usize,
}

/// A dataset is an indexed collection of samples.
///
/// Implementations must be `Send + Sync` so the loader can gather a
/// minibatch from several threads.
pub trait Dataset: Send + Sync {
    /// Total number of samples in the dataset.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieve the sample at position `index`.
    ///
    /// # Panics
    /// May panic if `index >= self.len()`.
    fn get(&self, index: usize) -> Sample;

    /// The shape of a single feature sample (without batch dim).
    fn feature_shape(&self) -> &[usize];

    /// Number of distinct labels.
    fn num_labels(&self) -> usize;

    fn name(&self) -> &str {
        "dataset"
    }
}

// VecDataset — samples held in memory

/// In-memory dataset backed by a `Vec<Sample>`.
pub struct VecDataset {
    samples: Vec<Sample>,
    feature_shape: Vec<usize>,
    num_labels: usize,
    name: String,
}

impl VecDataset {
    /// Build from samples; every sample must match `feature_shape`.
    pub fn new(samples: Vec<Sample>, feature_shape: Vec<usize>, name: &str) -> Result<Self> {
        let per_sample: usize = feature_shape.iter().product();
        if let Some(bad) = samples.iter().find(|s| s.features.len() != per_sample) {
            return Err(Error::ShapeMismatch {
                name: format!("{name} sample"),
                expected: feature_shape,
                got: vec![bad.features.len()],
            });
        }
        let num_labels = samples.iter().map(|s| s.label + 1).max().unwrap_or(0);
        Ok(Self {
            samples,
            feature_shape,
            num_labels,
            name: name.to_string(),
        })
    }

    /// Build from a row-major `[n, features...]` matrix and one label per row.
    pub fn from_flat(
        features: &[f64],
        feature_shape: &[usize],
        labels: &[usize],
        name: &str,
    ) -> Result<Self> {
        let per_sample: usize = feature_shape.iter().product();
        if per_sample == 0 || features.len() != labels.len() * per_sample {
            let mut expected = vec![labels.len()];
            expected.extend_from_slice(feature_shape);
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected,
                got: vec![features.len()],
            });
        }
        let samples = features
            .chunks_exact(per_sample)
            .zip(labels)
            .map(|(row, &label)| Sample {
                features: row.to_vec(),
                label,
            })
            .collect();
        Self::new(samples, feature_shape.to_vec(), name)
    }
}

impl Dataset for VecDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Sample {
        self.samples[index].clone()
    }

    fn feature_shape(&self) -> &[usize] {
        &self.feature_shape
    }

    fn num_labels(&self) -> usize {
        self.num_labels
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// SyntheticBlobs — linearly separable clusters for demos and tests

/// Gaussian-ish clusters, one per label, generated from a fixed seed.
///
/// Cluster `k` is centred on `spread * e_(k mod dims)` with a sign flip for
/// every `dims` labels, so labels are separable while `num_labels <= 2 * dims`.
pub struct SyntheticBlobs {
    inner: VecDataset,
}

impl SyntheticBlobs {
    pub fn new(n: usize, dims: usize, num_labels: usize, spread: f64, seed: u64) -> Result<Self> {
        if dims == 0 || num_labels == 0 {
            return Err(Error::msg("synthetic blobs need at least one dim and one label"));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut features = Vec::with_capacity(n * dims);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let label = i % num_labels;
            let axis = label % dims;
            let sign = if (label / dims) % 2 == 0 { 1.0 } else { -1.0 };
            for d in 0..dims {
                let centre = if d == axis { sign * spread } else { 0.0 };
                // Sum of uniforms as a cheap bell shape.
                let noise: f64 = (0..3).map(|_| rng.gen_range(-0.5..0.5)).sum();
                features.push(centre + noise);
            }
            labels.push(label);
        }
        let inner = VecDataset::from_flat(&features, &[dims], &labels, "blobs")?;
        Ok(Self { inner })
    }
}

impl Dataset for SyntheticBlobs {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn get(&self, index: usize) -> Sample {
        self.inner.get(index)
    }

    fn feature_shape(&self) -> &[usize] {
        self.inner.feature_shape()
    }

    fn num_labels(&self) -> usize {
        self.inner.num_labels()
    }

    fn name(&self) -> &str {
        "blobs"
    }
}
