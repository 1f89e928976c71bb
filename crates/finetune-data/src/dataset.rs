//! Class-directory datasets.
//!
//! A dataset root is laid out as:
//! ```text
//! root/
//! ├── cats/
//! │   ├── 0001.jpg
//! │   └── ...
//! └── dogs/
//!     └── ...
//! ```
//! Classes are the immediate subdirectories, sorted by name; the label of a
//! sample is the index of its class in that order.

use crate::loader::scan_images;
use finetune_core::{ClassLabel, Error, ImageSample, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ClassDirectory {
    root: PathBuf,
    classes: Vec<ClassLabel>,
    samples: Vec<ImageSample>,
}

impl ClassDirectory {
    /// Scans `root` for class subdirectories and their image files.
    pub fn scan(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            return Err(Error::NotFound(format!(
                "Dataset directory does not exist: {}",
                root.display()
            )));
        }
        if !root.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "Dataset path is not a directory: {}",
                root.display()
            )));
        }

        let mut class_names = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                class_names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        class_names.sort();

        if class_names.is_empty() {
            return Err(Error::Dataset(format!(
                "No class subdirectories found in {}",
                root.display()
            )));
        }

        let classes: Vec<ClassLabel> = class_names
            .into_iter()
            .enumerate()
            .map(|(id, name)| ClassLabel::new(id, name))
            .collect();

        let mut samples = Vec::new();
        for class in &classes {
            let images = scan_images(&root.join(&class.name))?;
            debug!("Class '{}' ({}): {} images", class.name, class.id, images.len());
            samples.extend(images.into_iter().map(|path| ImageSample::new(path, class.id)));
        }

        if samples.is_empty() {
            return Err(Error::Dataset(format!(
                "No image files found under {}",
                root.display()
            )));
        }

        info!(
            "Found {} images belonging to {} classes in {}",
            samples.len(),
            classes.len(),
            root.display()
        );

        Ok(Self {
            root,
            classes,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[ClassLabel] {
        &self.classes
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of samples per class, in label order
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for sample in &self.samples {
            counts[sample.label] += 1;
        }
        counts
    }

    /// Binary labels need exactly two classes.
    pub fn ensure_binary(&self) -> Result<()> {
        if self.classes.len() != 2 {
            return Err(Error::Dataset(format!(
                "Binary classification needs exactly 2 class directories in {}, found {}: {:?}",
                self.root.display(),
                self.classes.len(),
                self.class_names()
            )));
        }
        Ok(())
    }

    /// Both splits must share the same class subdirectories.
    pub fn ensure_same_layout(&self, other: &ClassDirectory) -> Result<()> {
        if self.class_names() != other.class_names() {
            return Err(Error::Dataset(format!(
                "Class layout of {} {:?} does not match {} {:?}",
                self.root.display(),
                self.class_names(),
                other.root.display(),
                other.class_names()
            )));
        }
        Ok(())
    }

    fn class_names(&self) -> Vec<&str> {
        self.classes.iter().map(|c| c.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_image(path: &Path) {
        let img = image::ImageBuffer::from_fn(6, 6, |_, _| image::Rgb([10u8, 20u8, 30u8]));
        img.save(path).unwrap();
    }

    fn make_split(root: &Path, classes: &[(&str, usize)]) {
        for (name, count) in classes {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                write_image(&dir.join(format!("{i:03}.png")));
            }
        }
    }

    #[test]
    fn test_scan_assigns_sorted_labels() {
        let temp = TempDir::new().unwrap();
        make_split(temp.path(), &[("dogs", 3), ("cats", 2)]);

        let dataset = ClassDirectory::scan(temp.path()).unwrap();
        assert_eq!(dataset.classes()[0], ClassLabel::new(0, "cats"));
        assert_eq!(dataset.classes()[1], ClassLabel::new(1, "dogs"));
        assert_eq!(dataset.len(), 5);
        assert_eq!(dataset.class_counts(), vec![2, 3]);
        assert!(dataset.ensure_binary().is_ok());
    }

    #[test]
    fn test_missing_directory() {
        let result = ClassDirectory::scan("/nonexistent/data/train");
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_no_images_is_dataset_error() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("cats")).unwrap();
        fs::create_dir_all(temp.path().join("dogs")).unwrap();
        fs::write(temp.path().join("cats").join("notes.txt"), "x").unwrap();

        let result = ClassDirectory::scan(temp.path());
        assert!(matches!(result, Err(Error::Dataset(_))));
    }

    #[test]
    fn test_no_classes_is_dataset_error() {
        let temp = TempDir::new().unwrap();
        write_image(&temp.path().join("loose.png"));
        assert!(matches!(ClassDirectory::scan(temp.path()), Err(Error::Dataset(_))));
    }

    #[test]
    fn test_ensure_binary_rejects_three_classes() {
        let temp = TempDir::new().unwrap();
        make_split(temp.path(), &[("a", 1), ("b", 1), ("c", 1)]);
        let dataset = ClassDirectory::scan(temp.path()).unwrap();
        assert!(matches!(dataset.ensure_binary(), Err(Error::Dataset(_))));
    }

    #[test]
    fn test_layout_mismatch() {
        let train = TempDir::new().unwrap();
        let val = TempDir::new().unwrap();
        make_split(train.path(), &[("cats", 1), ("dogs", 1)]);
        make_split(val.path(), &[("cats", 1), ("wolves", 1)]);

        let train = ClassDirectory::scan(train.path()).unwrap();
        let val = ClassDirectory::scan(val.path()).unwrap();
        assert!(train.ensure_same_layout(&val).is_err());
        assert!(train.ensure_same_layout(&train).is_ok());
    }
}
