//! Data pipeline: labelled image-like samples and batching.
//!
//! Samples are dense `f32` feature maps of shape `[channels, height, width]`
//! with a `u32` class label. Batches are `(features, labels)` flat vectors;
//! [`batch_to_tensors`] turns one into `(N, C, H, W)` / `(N,)` tensors.
//!
//! * **[`BatchDataset`]** — finite, restartable batch source.
//! * **[`InMemoryDataset`]** — everything in RAM; JSON load/save, synthetic
//!   generator, train/validation split.

use std::path::Path;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{NasError, Result};

// ── BatchDataset trait ──────────────────────────────────────────────────────

/// Common interface for datasets that yield `(features, labels)` batches.
///
/// Every call to [`batches`](Self::batches) restarts from the first sample.
pub trait BatchDataset {
    /// Number of samples.
    fn len(&self) -> usize;

    /// `[channels, height, width]` of one sample.
    fn sample_shape(&self) -> [usize; 3];

    fn batches(&self, batch_size: usize) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + '_>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches per pass; the trailing partial batch counts.
    fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.len().div_ceil(batch_size)
        }
    }
}

// ── InMemoryDataset ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryDataset {
    shape: [usize; 3],
    features: Vec<f32>,
    labels: Vec<u32>,
}

impl InMemoryDataset {
    pub fn new(shape: [usize; 3], features: Vec<f32>, labels: Vec<u32>) -> Result<Self> {
        let per_sample: usize = shape.iter().product();
        if per_sample == 0 {
            return Err(NasError::config(format!("invalid sample shape {shape:?}")));
        }
        if features.len() != labels.len() * per_sample {
            return Err(NasError::config(format!(
                "{} features do not match {} labels of shape {shape:?}",
                features.len(),
                labels.len()
            )));
        }
        Ok(Self {
            shape,
            features,
            labels,
        })
    }

    /// Class-conditional synthetic data: each class has a fixed random
    /// prototype and samples are the prototype plus uniform noise.
    pub fn synthetic(num_samples: usize, classes: usize, shape: [usize; 3], seed: u64) -> Result<Self> {
        if classes == 0 {
            return Err(NasError::config("synthetic dataset needs at least one class"));
        }
        let per_sample: usize = shape.iter().product();
        let mut rng = StdRng::seed_from_u64(seed);
        let prototypes: Vec<Vec<f32>> = (0..classes)
            .map(|_| (0..per_sample).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
            .collect();

        let mut features = Vec::with_capacity(num_samples * per_sample);
        let mut labels = Vec::with_capacity(num_samples);
        for _ in 0..num_samples {
            let label = rng.gen_range(0..classes);
            features.extend(
                prototypes[label]
                    .iter()
                    .map(|&p| p + rng.gen_range(-0.5f32..0.5)),
            );
            labels.push(label as u32);
        }
        Self::new(shape, features, labels)
    }

    /// Split off the trailing `val_fraction` of samples as a second dataset.
    pub fn split(self, val_fraction: f64) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&val_fraction) {
            return Err(NasError::config(format!(
                "val_fraction must be in [0, 1), got {val_fraction}"
            )));
        }
        let per_sample: usize = self.shape.iter().product();
        let n_val = (self.labels.len() as f64 * val_fraction).round() as usize;
        let n_train = self.labels.len() - n_val;

        let Self {
            shape,
            mut features,
            mut labels,
        } = self;
        let val_features = features.split_off(n_train * per_sample);
        let val_labels = labels.split_off(n_train);
        Ok((
            Self::new(shape, features, labels)?,
            Self::new(shape, val_features, val_labels)?,
        ))
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let raw: Self = serde_json::from_str(&json)?;
        Self::new(raw.shape, raw.features, raw.labels)
    }
}

impl BatchDataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.labels.len()
    }

    fn sample_shape(&self) -> [usize; 3] {
        self.shape
    }

    fn batches(&self, batch_size: usize) -> Box<dyn Iterator<Item = (Vec<f32>, Vec<u32>)> + '_> {
        let per_sample: usize = self.shape.iter().product();
        let batch_size = batch_size.max(1);
        Box::new(self.labels.chunks(batch_size).enumerate().map(move |(i, labels)| {
            let start = i * batch_size * per_sample;
            let end = start + labels.len() * per_sample;
            (self.features[start..end].to_vec(), labels.to_vec())
        }))
    }
}

/// Convert a raw batch into `(N, C, H, W)` features and `(N,)` labels.
pub fn batch_to_tensors(
    features: Vec<f32>,
    labels: Vec<u32>,
    shape: [usize; 3],
    device: &Device,
) -> candle_core::Result<(Tensor, Tensor)> {
    let n = labels.len();
    let [c, h, w] = shape;
    let input = Tensor::from_vec(features, (n, c, h, w), device)?;
    let labels = Tensor::from_vec(labels, n, device)?;
    Ok((input, labels))
}

// ── Tests ───────────────────────────────────────────────────────────────────
