//! Data pipeline: synthetic classification data and batching.
//!
//! * **[`BlobDataset`]** — Gaussian clusters, one per class, generated
//!   deterministically from a seed and split into train / validation parts.
//! * **[`batch_to_tensors`]** — raw batch → Candle tensors.

use candle_core::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::sections::DatasetConfig;

/// Range of blob centres along each feature axis.
const CENTRE_RANGE: f64 = 3.0;

// ── BlobDataset ─────────────────────────────────────────────────────────────

/// In-memory labelled feature vectors (row-major `num_examples × num_features`).
#[derive(Debug, Clone)]
pub struct BlobDataset {
    features: Vec<f32>,
    labels: Vec<u32>,
    num_features: usize,
    num_classes: usize,
}

impl BlobDataset {
    /// Generate the full dataset and split it into `(train, validation)`.
    pub fn generate(config: &DatasetConfig) -> (Self, Self) {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let d = config.num_features;

        let centres: Vec<Vec<f64>> = (0..config.num_classes)
            .map(|_| {
                (0..d)
                    .map(|_| rng.gen_range(-CENTRE_RANGE..CENTRE_RANGE))
                    .collect()
            })
            .collect();

        let mut order: Vec<usize> = (0..config.num_examples).collect();
        order.shuffle(&mut rng);

        let mut features = Vec::with_capacity(config.num_examples * d);
        let mut labels = Vec::with_capacity(config.num_examples);
        for &i in &order {
            let class = i % config.num_classes.max(1);
            for centre in &centres[class] {
                let noise: f64 = rng.sample(StandardNormal);
                features.push((centre + config.spread * noise) as f32);
            }
            labels.push(class as u32);
        }

        let num_val = ((config.num_examples as f64) * config.validation_fraction)
            .round()
            .clamp(0.0, config.num_examples as f64) as usize;
        let num_train = config.num_examples - num_val;

        let val_features = features.split_off(num_train * d);
        let val_labels = labels.split_off(num_train);

        let train = Self {
            features,
            labels,
            num_features: d,
            num_classes: config.num_classes,
        };
        let val = Self {
            features: val_features,
            labels: val_labels,
            num_features: d,
            num_classes: config.num_classes,
        };
        (train, val)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `batch_size` examples starting at `start`, wrapping around the end.
    pub fn batch(&self, start: usize, batch_size: usize) -> (Vec<f32>, Vec<u32>) {
        let n = self.len();
        let d = self.num_features;
        let mut features = Vec::with_capacity(batch_size * d);
        let mut labels = Vec::with_capacity(batch_size);
        if n == 0 {
            return (features, labels);
        }
        for k in 0..batch_size {
            let i = (start + k) % n;
            features.extend_from_slice(&self.features[i * d..(i + 1) * d]);
            labels.push(self.labels[i]);
        }
        (features, labels)
    }

    /// Sequential non-wrapping batches; the last one may be short.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = (Vec<f32>, Vec<u32>)> + '_ {
        let batch_size = batch_size.max(1);
        (0..self.len()).step_by(batch_size).map(move |start| {
            let size = batch_size.min(self.len() - start);
            self.batch(start, size)
        })
    }
}

/// Convert a raw batch into `(features [B, D] f32, labels [B] u32)` tensors.
pub fn batch_to_tensors(
    features: &[f32],
    labels: &[u32],
    num_features: usize,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let batch = labels.len();
    let x = Tensor::from_slice(features, (batch, num_features), device)?;
    let y = Tensor::from_slice(labels, batch, device)?;
    Ok((x, y))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> DatasetConfig {
        DatasetConfig {
            num_examples: 100,
            num_features: 3,
            num_classes: 4,
            validation_fraction: 0.2,
            ..Default::default()
        }
    }

    #[test]
    fn split_sizes() {
        let (train, val) = BlobDataset::generate(&small());
        assert_eq!(train.len(), 80);
        assert_eq!(val.len(), 20);
        assert_eq!(train.num_features(), 3);
        assert!(train.labels.iter().all(|&l| l < 4));
    }

    #[test]
    fn generation_is_deterministic() {
        let (a, _) = BlobDataset::generate(&small());
        let (b, _) = BlobDataset::generate(&small());
        assert_eq!(a.features, b.features);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn noise_follows_spread() {
        let flat = DatasetConfig {
            spread: 0.0,
            ..small()
        };
        let (train, _) = BlobDataset::generate(&flat);
        for class in 0..4u32 {
            let rows: Vec<&[f32]> = (0..train.len())
                .filter(|&i| train.labels[i] == class)
                .map(|i| &train.features[i * 3..(i + 1) * 3])
                .collect();
            assert!(rows.windows(2).all(|w| w[0] == w[1]));
        }

        let noisy = DatasetConfig {
            num_examples: 4000,
            num_features: 1,
            num_classes: 1,
            spread: 0.5,
            validation_fraction: 0.0,
            ..Default::default()
        };
        let (train, _) = BlobDataset::generate(&noisy);
        let n = train.len() as f64;
        let mean = train.features.iter().map(|&x| x as f64).sum::<f64>() / n;
        let var = train
            .features
            .iter()
            .map(|&x| (x as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        assert!((var.sqrt() - 0.5).abs() < 0.05, "std = {}", var.sqrt());
    }

    #[test]
    fn batch_wraps_around() {
        let (train, _) = BlobDataset::generate(&small());
        let (x, y) = train.batch(78, 4);
        assert_eq!(y.len(), 4);
        assert_eq!(x.len(), 12);
        assert_eq!(y[2], train.labels[0]);
        assert_eq!(&x[6..9], &train.features[0..3]);
    }

    #[test]
    fn batches_cover_everything_once() {
        let (train, _) = BlobDataset::generate(&small());
        let sizes: Vec<usize> = train.batches(32).map(|(_, y)| y.len()).collect();
        assert_eq!(sizes, vec![32, 32, 16]);
    }

    #[test]
    fn tensors_have_expected_shapes() {
        let (train, _) = BlobDataset::generate(&small());
        let (x, y) = train.batch(0, 5);
        let (x, y) = batch_to_tensors(&x, &y, 3, &Device::Cpu).unwrap();
        assert_eq!(x.dims(), &[5, 3]);
        assert_eq!(y.dims(), &[5]);
    }
}
