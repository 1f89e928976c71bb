//! Unbounded, shuffled batch streams.
//!
//! A stream walks over a shuffled permutation of its samples and reshuffles
//! when the permutation is exhausted, so it never ends. The final batch of a
//! pass holds whatever samples remain and may be smaller than the batch size.
//! Shuffling and augmentation draw from ChaCha8 generators derived from a
//! single seed, which makes the sequence of batches fully reproducible.

use crate::augmentation::Augmenter;
use crate::batcher::ImageItem;
use crate::loader::ImageLoader;
use crate::preprocess::to_chw_tensor;
use finetune_core::{Error, ImageSample, PixelScaling, Result};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::debug;

/// Stream offset separating the augmentation generator from the shuffles
const AUGMENT_STREAM: u64 = 1;

pub struct BatchStream {
    name: String,
    samples: Vec<ImageSample>,
    loader: ImageLoader,
    scaling: PixelScaling,
    augmenter: Option<Augmenter>,
    batch_size: usize,
    seed: u64,
    order: Vec<usize>,
    cursor: usize,
    passes: u64,
    batches_seen: u64,
    augment_rng: ChaCha8Rng,
}

impl BatchStream {
    pub fn new(
        name: impl Into<String>,
        samples: Vec<ImageSample>,
        loader: ImageLoader,
        batch_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let name = name.into();
        if samples.is_empty() {
            return Err(Error::Dataset(format!("Batch stream '{name}' has no samples")));
        }
        if batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be greater than 0".to_string()));
        }

        let mut stream = Self {
            name,
            samples,
            loader,
            scaling: PixelScaling::default(),
            augmenter: None,
            batch_size,
            seed,
            order: Vec::new(),
            cursor: 0,
            passes: 0,
            batches_seen: 0,
            augment_rng: augment_rng(seed),
        };
        stream.reset();
        Ok(stream)
    }

    /// Enables random augmentation of every loaded image
    pub fn with_augmenter(mut self, augmenter: Augmenter) -> Self {
        self.augmenter = Some(augmenter);
        self
    }

    pub fn with_scaling(mut self, scaling: PixelScaling) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn batches_seen(&self) -> u64 {
        self.batches_seen
    }

    /// Restarts the stream from its initial, seeded state.
    pub fn reset(&mut self) {
        self.passes = 0;
        self.batches_seen = 0;
        self.augment_rng = augment_rng(self.seed);
        self.shuffle();
    }

    fn shuffle(&mut self) {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(self.passes));
        self.order = (0..self.samples.len()).collect();
        self.order.shuffle(&mut rng);
        self.cursor = 0;
    }

    /// Sample indices making up the next batch; advances the stream.
    pub fn next_batch_indices(&mut self) -> Vec<usize> {
        if self.cursor >= self.order.len() {
            self.passes += 1;
            self.shuffle();
            debug!("Stream '{}' starting pass {}", self.name, self.passes);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;
        self.batches_seen += 1;
        indices
    }

    /// Loads, augments and preprocesses the next batch.
    pub fn next_batch(&mut self) -> Result<Vec<ImageItem>> {
        let indices = self.next_batch_indices();

        // Seeds are drawn in order so parallel decoding stays deterministic.
        let seeds: Vec<u64> = indices.iter().map(|_| self.augment_rng.gen()).collect();

        let loader = &self.loader;
        let augmenter = self.augmenter.as_ref();
        let scaling = self.scaling;

        indices
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(&index, &seed)| {
                let sample = &self.samples[index];
                let image = loader.load(&sample.path)?;
                let image = match augmenter {
                    Some(augmenter) => {
                        let mut rng = ChaCha8Rng::seed_from_u64(seed);
                        augmenter.augment(&image, &mut rng)
                    }
                    None => image,
                };
                Ok(ImageItem {
                    image: to_chw_tensor(&image, scaling),
                    label: sample.label,
                })
            })
            .collect()
    }
}

impl Iterator for BatchStream {
    type Item = Result<Vec<ImageItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_batch())
    }
}

fn augment_rng(seed: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(AUGMENT_STREAM);
    rng
}

#[cfg(test)]
mod tests {
    use super::*;
    use finetune_core::{AugmentationConfig, ImageDimensions};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn fake_samples(n: usize) -> Vec<ImageSample> {
        (0..n)
            .map(|i| ImageSample::new(PathBuf::from(format!("img_{i}.png")), i % 2))
            .collect()
    }

    fn stream(n: usize, batch_size: usize, seed: u64) -> BatchStream {
        let loader = ImageLoader::new(ImageDimensions::new(8, 8, 3));
        BatchStream::new("test", fake_samples(n), loader, batch_size, seed).unwrap()
    }

    #[test]
    fn test_same_seed_same_order() {
        let mut a = stream(50, 8, 123);
        let mut b = stream(50, 8, 123);
        for _ in 0..20 {
            assert_eq!(a.next_batch_indices(), b.next_batch_indices());
        }
    }

    #[test]
    fn test_different_seed_different_order() {
        let mut a = stream(50, 50, 123);
        let mut b = stream(50, 50, 124);
        assert_ne!(a.next_batch_indices(), b.next_batch_indices());
    }

    #[test]
    fn test_pass_covers_every_sample_once() {
        let mut s = stream(10, 4, 123);
        let mut seen: Vec<usize> = Vec::new();
        let sizes: Vec<usize> = (0..3)
            .map(|_| {
                let batch = s.next_batch_indices();
                seen.extend(&batch);
                batch.len()
            })
            .collect();

        assert_eq!(sizes, vec![4, 4, 2]);
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_stream_is_unbounded_and_reshuffles() {
        let mut s = stream(6, 6, 123);
        let first = s.next_batch_indices();
        let second = s.next_batch_indices();
        assert_eq!(first.len(), 6);
        assert_eq!(second.len(), 6);
        // A new pass uses a new permutation of the same samples
        let mut sorted = second.clone();
        sorted.sort();
        assert_eq!(sorted, (0..6).collect::<Vec<_>>());
        assert_eq!(s.batches_seen(), 2);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut s = stream(30, 7, 123);
        let first: Vec<Vec<usize>> = (0..6).map(|_| s.next_batch_indices()).collect();
        s.reset();
        let again: Vec<Vec<usize>> = (0..6).map(|_| s.next_batch_indices()).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn test_empty_stream_rejected() {
        let loader = ImageLoader::new(ImageDimensions::new(8, 8, 3));
        let result = BatchStream::new("empty", Vec::new(), loader, 4, 123);
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_next_batch_loads_and_augments_deterministically() {
        let temp = TempDir::new().unwrap();
        let samples: Vec<ImageSample> = (0..5)
            .map(|i| {
                let path = temp.path().join(format!("{i}.png"));
                let img = image::ImageBuffer::from_fn(12, 12, |x, y| {
                    image::Rgb([(x * 20) as u8, (y * 20) as u8, (i * 40) as u8])
                });
                img.save(&path).unwrap();
                ImageSample::new(path, i % 2)
            })
            .collect();

        let dims = ImageDimensions::new(8, 8, 3);
        let make = || {
            BatchStream::new("train", samples.clone(), ImageLoader::new(dims), 2, 123)
                .unwrap()
                .with_augmenter(Augmenter::new(AugmentationConfig::default()))
        };

        let mut a = make();
        let mut b = make();
        for _ in 0..4 {
            let batch_a = a.next_batch().unwrap();
            let batch_b = b.next_batch().unwrap();
            assert!(batch_a.len() <= 2);
            for (x, y) in batch_a.iter().zip(&batch_b) {
                assert_eq!(x.label, y.label);
                assert_eq!(x.image, y.image);
                assert_eq!(x.image.len(), dims.num_values());
            }
        }
    }

    #[test]
    fn test_missing_file_surfaces_error() {
        let mut s = stream(4, 2, 123);
        assert!(s.next().unwrap().is_err());
    }
}
