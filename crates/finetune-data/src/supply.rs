//! Training and validation batch sources for a run.

use crate::augmentation::Augmenter;
use crate::dataset::ClassDirectory;
use crate::loader::ImageLoader;
use crate::stream::BatchStream;
use finetune_core::{ClassLabel, DataSplit, Result, RunConfig};
use tracing::{info, warn};

pub struct DataSupply {
    pub train: BatchStream,
    pub validation: BatchStream,
    classes: Vec<ClassLabel>,
}

impl DataSupply {
    /// Scans both dataset roots and builds their batch streams.
    ///
    /// Fails if either directory is missing, holds no images, is not a
    /// two-class layout, or if the two layouts differ.
    pub fn new(config: &RunConfig) -> Result<Self> {
        let data = &config.data;

        let train_dir = ClassDirectory::scan(&data.train_dir)?;
        let validation_dir = ClassDirectory::scan(&data.validation_dir)?;
        train_dir.ensure_binary()?;
        train_dir.ensure_same_layout(&validation_dir)?;

        for class in train_dir.classes() {
            info!("Class {} -> label {}", class.name, class.id);
        }
        check_sample_count(DataSplit::Train, train_dir.len(), data.train_samples);
        check_sample_count(DataSplit::Validation, validation_dir.len(), data.validation_samples);

        let loader = ImageLoader::new(data.image_size);

        let mut train = BatchStream::new(
            DataSplit::Train.to_string(),
            train_dir.samples().to_vec(),
            loader,
            config.batch_size,
            data.seed,
        )?
        .with_scaling(data.pixel_scaling);
        if !data.augmentation.is_identity() {
            train = train.with_augmenter(Augmenter::new(data.augmentation.clone()));
        }

        let validation = BatchStream::new(
            DataSplit::Validation.to_string(),
            validation_dir.samples().to_vec(),
            loader,
            config.batch_size,
            data.seed,
        )?
        .with_scaling(data.pixel_scaling);

        Ok(Self {
            train,
            validation,
            classes: train_dir.classes().to_vec(),
        })
    }

    pub fn classes(&self) -> &[ClassLabel] {
        &self.classes
    }
}

fn check_sample_count(split: DataSplit, found: usize, configured: usize) {
    if found < configured {
        warn!(
            "{split}: configured {configured} samples per epoch but only {found} images exist; \
             batches will repeat within an epoch"
        );
    } else if found != configured {
        info!("{split}: {found} images found, {configured} used per epoch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finetune_core::{Error, ImageDimensions};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn make_split(root: &Path, classes: &[&str], per_class: usize) {
        for class in classes {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let img = image::ImageBuffer::from_fn(10, 10, |_, _| image::Rgb([i as u8, 0u8, 0u8]));
                img.save(dir.join(format!("{i}.png"))).unwrap();
            }
        }
    }

    fn config_for(root: &Path) -> RunConfig {
        let mut config = RunConfig::default();
        config.data.train_dir = root.join("train");
        config.data.validation_dir = root.join("validation");
        config.data.image_size = ImageDimensions::new(8, 8, 3);
        config.data.train_samples = 8;
        config.data.validation_samples = 4;
        config.batch_size = 4;
        config
    }

    #[test]
    fn test_supply_builds_both_streams() {
        let temp = TempDir::new().unwrap();
        make_split(&temp.path().join("train"), &["cats", "dogs"], 4);
        make_split(&temp.path().join("validation"), &["cats", "dogs"], 2);

        let mut supply = DataSupply::new(&config_for(temp.path())).unwrap();
        assert_eq!(supply.classes().len(), 2);
        assert_eq!(supply.train.num_samples(), 8);
        assert_eq!(supply.validation.num_samples(), 4);

        let batch = supply.train.next_batch().unwrap();
        assert_eq!(batch.len(), 4);
        assert!(batch.iter().all(|item| item.label < 2));
        assert_eq!(batch[0].image.len(), 8 * 8 * 3);
    }

    #[test]
    fn test_missing_validation_dir() {
        let temp = TempDir::new().unwrap();
        make_split(&temp.path().join("train"), &["cats", "dogs"], 2);

        let result = DataSupply::new(&config_for(temp.path()));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_layout_mismatch_fails() {
        let temp = TempDir::new().unwrap();
        make_split(&temp.path().join("train"), &["cats", "dogs"], 2);
        make_split(&temp.path().join("validation"), &["cats", "foxes"], 2);

        let result = DataSupply::new(&config_for(temp.path()));
        assert!(matches!(result, Err(Error::Dataset(_))));
    }
}
