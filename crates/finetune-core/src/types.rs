//! Core type definitions shared across the data and training crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A class discovered as a subdirectory of a dataset root
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ClassLabel {
    /// Label index, assigned in sorted name order
    pub id: usize,
    /// Subdirectory name
    pub name: String,
}

impl ClassLabel {
    pub fn new(id: usize, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Represents an image file with its label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label (index)
    pub label: usize,
}

impl ImageSample {
    pub fn new(path: PathBuf, label: usize) -> Self {
        Self { path, label }
    }
}

/// Data split type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataSplit {
    /// Training data, augmented
    Train,
    /// Validation data, resized only
    Validation,
}

impl std::fmt::Display for DataSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSplit::Train => write!(f, "train"),
            DataSplit::Validation => write!(f, "validation"),
        }
    }
}

/// The two training phases of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TrainingPhase {
    /// Head-only training on a frozen backbone
    Warmup,
    /// Training with the top of the backbone unfrozen
    FineTune,
}

impl TrainingPhase {
    /// Directory name used for the phase's scalar logs
    pub fn log_dir_name(&self) -> &'static str {
        match self {
            TrainingPhase::Warmup => "training",
            TrainingPhase::FineTune => "fine_tuning",
        }
    }
}

impl std::fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingPhase::Warmup => write!(f, "warm-up"),
            TrainingPhase::FineTune => write!(f, "fine-tuning"),
        }
    }
}

/// Image dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl ImageDimensions {
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// InceptionV3 input size (299x299 RGB)
    pub fn inception() -> Self {
        Self::new(299, 299, 3)
    }

    /// Number of f32 values in one CHW image
    pub fn num_values(&self) -> usize {
        (self.width * self.height * self.channels) as usize
    }
}

impl Default for ImageDimensions {
    fn default() -> Self {
        Self::inception()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inception_dimensions() {
        let dims = ImageDimensions::inception();
        assert_eq!((dims.width, dims.height, dims.channels), (299, 299, 3));
        assert_eq!(dims.num_values(), 299 * 299 * 3);
    }

    #[test]
    fn test_phase_log_dirs() {
        assert_eq!(TrainingPhase::Warmup.log_dir_name(), "training");
        assert_eq!(TrainingPhase::FineTune.log_dir_name(), "fine_tuning");
    }

    #[test]
    fn test_split_display() {
        assert_eq!(DataSplit::Train.to_string(), "train");
        assert_eq!(DataSplit::Validation.to_string(), "validation");
    }
}
