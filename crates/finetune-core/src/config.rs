//! Run configuration.
//!
//! Every default below is the value a plain `finetune` invocation trains
//! with. A TOML file may override individual fields of `data`, `model` and
//! `output`, or replace a whole phase section.

use crate::types::ImageDimensions;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name stem shared by checkpoints and the final artifacts
pub const MODEL_NAME: &str = "inception_v3";

/// Smallest input side the InceptionV3 backbone accepts
pub const MIN_IMAGE_SIDE: u32 = 75;

/// Layers in the InceptionV3 backbone graph, input layer included
pub const BACKBONE_LAYERS: usize = 311;

/// Number of optimizer steps in one pass: `floor(samples / batch_size)`.
pub fn steps_per_epoch(samples: usize, batch_size: usize) -> usize {
    if batch_size == 0 {
        return 0;
    }
    samples / batch_size
}

/// Top-level configuration for a two-phase run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    /// Phase 1: head only
    pub warmup: PhaseConfig,
    /// Phase 2: top of the backbone unfrozen
    pub fine_tune: PhaseConfig,
    /// Batch size shared by both sources and phases
    pub batch_size: usize,
    pub output: OutputConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            model: ModelConfig::default(),
            warmup: PhaseConfig::warmup(),
            fine_tune: PhaseConfig::fine_tune(),
            batch_size: 32,
            output: OutputConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn train_steps(&self) -> usize {
        steps_per_epoch(self.data.train_samples, self.batch_size)
    }

    pub fn validation_steps(&self) -> usize {
        steps_per_epoch(self.data.validation_samples, self.batch_size)
    }

    /// Checks every constraint the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".to_string()));
        }
        if self.train_steps() == 0 {
            return Err(Error::Config(format!(
                "train_samples ({}) is smaller than batch_size ({}): zero steps per epoch",
                self.data.train_samples, self.batch_size
            )));
        }
        if self.validation_steps() == 0 {
            return Err(Error::Config(format!(
                "validation_samples ({}) is smaller than batch_size ({}): zero validation steps",
                self.data.validation_samples, self.batch_size
            )));
        }
        let dims = self.data.image_size;
        if dims.width < MIN_IMAGE_SIDE || dims.height < MIN_IMAGE_SIDE {
            return Err(Error::Config(format!(
                "image_size must be at least {MIN_IMAGE_SIDE}x{MIN_IMAGE_SIDE}, got {}x{}",
                dims.width, dims.height
            )));
        }
        if dims.channels != 3 {
            return Err(Error::Config(format!(
                "image_size.channels must be 3 (RGB), got {}",
                dims.channels
            )));
        }
        self.data.augmentation.validate()?;
        self.warmup.validate("warmup")?;
        self.fine_tune.validate("fine_tune")?;
        if self.model.head_units == 0 {
            return Err(Error::Config("model.head_units must be greater than 0".to_string()));
        }
        if self.model.fine_tune_boundary >= BACKBONE_LAYERS {
            return Err(Error::Config(format!(
                "model.fine_tune_boundary must be below {BACKBONE_LAYERS}, got {}",
                self.model.fine_tune_boundary
            )));
        }
        Ok(())
    }
}

/// Dataset locations and loading parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// `train_dir/<class>/<images>`
    pub train_dir: PathBuf,
    /// `validation_dir/<class>/<images>`
    pub validation_dir: PathBuf,
    pub image_size: ImageDimensions,
    /// Sample counts used to derive steps per epoch
    pub train_samples: usize,
    pub validation_samples: usize,
    /// Shuffle and augmentation seed
    pub seed: u64,
    pub pixel_scaling: PixelScaling,
    /// Applied to the training source only
    pub augmentation: AugmentationConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("data/train"),
            validation_dir: PathBuf::from("data/validation"),
            image_size: ImageDimensions::inception(),
            train_samples: 3064,
            validation_samples: 400,
            seed: 123,
            pixel_scaling: PixelScaling::default(),
            augmentation: AugmentationConfig::default(),
        }
    }
}

/// How 8-bit pixel values are mapped to network inputs
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PixelScaling {
    /// `x / 127.5 - 1`, the range InceptionV3 was trained on
    #[default]
    Inception,
    /// `x / 255`
    Unit,
    /// Unscaled 0..=255 values
    Raw,
}

impl PixelScaling {
    pub fn apply(&self, value: u8) -> f32 {
        let v = value as f32;
        match self {
            PixelScaling::Inception => v / 127.5 - 1.0,
            PixelScaling::Unit => v / 255.0,
            PixelScaling::Raw => v,
        }
    }
}

/// Data augmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Random rotation range in degrees
    pub rotation_range: f32,
    /// Horizontal shift as a fraction of the width
    pub width_shift_range: f32,
    /// Vertical shift as a fraction of the height
    pub height_shift_range: f32,
    /// Random horizontal flip with probability 0.5
    pub horizontal_flip: bool,
    /// Random vertical flip with probability 0.5
    pub vertical_flip: bool,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_range: 20.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            horizontal_flip: true,
            vertical_flip: false,
        }
    }
}

impl AugmentationConfig {
    /// No augmentation at all
    pub fn disabled() -> Self {
        Self {
            rotation_range: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
            horizontal_flip: false,
            vertical_flip: false,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.rotation_range == 0.0
            && self.width_shift_range == 0.0
            && self.height_shift_range == 0.0
            && !self.horizontal_flip
            && !self.vertical_flip
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=180.0).contains(&self.rotation_range) {
            return Err(Error::Config(format!(
                "rotation_range must be within [0, 180] degrees, got {}",
                self.rotation_range
            )));
        }
        for (name, value) in [
            ("width_shift_range", self.width_shift_range),
            ("height_shift_range", self.height_shift_range),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Model assembly parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Burn record holding the ImageNet backbone weights (without `.mpk`).
    /// `None` starts the backbone from random initialization.
    pub pretrained_weights: Option<PathBuf>,
    /// Units of the hidden dense layer in the head
    pub head_units: usize,
    /// First layer index left trainable in phase 2
    pub fine_tune_boundary: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            pretrained_weights: Some(PathBuf::from("weights/inception_v3_imagenet")),
            head_units: 1024,
            fine_tune_boundary: 249,
        }
    }
}

/// Optimizer and its hyperparameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OptimizerConfig {
    /// RMSprop with a fixed learning rate
    RmsProp {
        learning_rate: f64,
        rho: f32,
        epsilon: f32,
    },
    /// SGD with momentum and inverse-time learning-rate decay
    Sgd {
        learning_rate: f64,
        momentum: f64,
        decay: f64,
    },
}

impl OptimizerConfig {
    pub fn learning_rate(&self) -> f64 {
        match self {
            OptimizerConfig::RmsProp { learning_rate, .. } => *learning_rate,
            OptimizerConfig::Sgd { learning_rate, .. } => *learning_rate,
        }
    }

    /// Per-step decay factor, zero for a constant rate
    pub fn decay(&self) -> f64 {
        match self {
            OptimizerConfig::RmsProp { .. } => 0.0,
            OptimizerConfig::Sgd { decay, .. } => *decay,
        }
    }
}

impl std::fmt::Display for OptimizerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerConfig::RmsProp { learning_rate, .. } => {
                write!(f, "rmsprop(lr={learning_rate})")
            }
            OptimizerConfig::Sgd {
                learning_rate,
                momentum,
                decay,
            } => write!(f, "sgd(lr={learning_rate}, momentum={momentum}, decay={decay})"),
        }
    }
}

/// Hyperparameters and callbacks of one training phase.
///
/// A phase section in a TOML file must be complete; only whole sections fall
/// back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Maximum number of epochs
    pub epochs: usize,
    pub optimizer: OptimizerConfig,
    /// Stop after this many epochs without a lower validation loss
    pub early_stopping_patience: Option<usize>,
    /// Save weights whenever validation accuracy reaches a new best
    pub checkpoint_best: bool,
    /// Append epoch metrics to the semicolon CSV log
    pub csv_log: bool,
}

impl PhaseConfig {
    pub fn warmup() -> Self {
        Self {
            epochs: 20,
            optimizer: OptimizerConfig::RmsProp {
                learning_rate: 0.001,
                rho: 0.9,
                epsilon: 1e-7,
            },
            early_stopping_patience: None,
            checkpoint_best: false,
            csv_log: false,
        }
    }

    pub fn fine_tune() -> Self {
        Self {
            epochs: 40,
            optimizer: OptimizerConfig::Sgd {
                learning_rate: 0.0001,
                momentum: 0.9,
                decay: 1e-5,
            },
            early_stopping_patience: Some(10),
            checkpoint_best: true,
            csv_log: true,
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::Config(format!("{name}.epochs must be greater than 0")));
        }
        let lr = self.optimizer.learning_rate();
        if !(lr > 0.0 && lr.is_finite()) {
            return Err(Error::Config(format!(
                "{name}.optimizer learning_rate must be positive, got {lr}"
            )));
        }
        if self.optimizer.decay() < 0.0 {
            return Err(Error::Config(format!("{name}.optimizer decay must not be negative")));
        }
        if self.early_stopping_patience == Some(0) {
            return Err(Error::Config(format!(
                "{name}.early_stopping_patience must be at least 1"
            )));
        }
        Ok(())
    }
}

/// Where the run writes its artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub root: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("output"),
        }
    }
}

impl OutputConfig {
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Scalar log directory of one phase
    pub fn phase_log_dir(&self, phase: crate::TrainingPhase) -> PathBuf {
        self.logs_dir().join(phase.log_dir_name())
    }

    pub fn csv_log_path(&self) -> PathBuf {
        self.logs_dir().join("training.csv")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    /// Final weights, without the `.mpk` the recorder appends
    pub fn weights_path(&self) -> PathBuf {
        self.root.join(format!("{MODEL_NAME}_finetuned"))
    }

    pub fn structure_path(&self) -> PathBuf {
        self.root.join(format!("{MODEL_NAME}_finetuned.json"))
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("run_config.toml")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.logs_dir(),
            self.checkpoint_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TrainingPhase;

    #[test]
    fn test_default_run_config() {
        let config = RunConfig::default();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.data.seed, 123);
        assert_eq!(config.data.image_size, ImageDimensions::new(299, 299, 3));
        assert_eq!(config.warmup.epochs, 20);
        assert_eq!(config.fine_tune.epochs, 40);
        assert_eq!(config.fine_tune.early_stopping_patience, Some(10));
        assert_eq!(config.model.fine_tune_boundary, 249);
        assert_eq!(config.model.head_units, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_steps() {
        let config = RunConfig::default();
        assert_eq!(config.train_steps(), 95);
        assert_eq!(config.validation_steps(), 12);
    }

    #[test]
    fn test_steps_per_epoch_is_floor() {
        for batch in 1..=64 {
            for samples in [0, 1, 31, 32, 33, 400, 3064] {
                assert_eq!(steps_per_epoch(samples, batch), samples / batch);
                assert!(steps_per_epoch(samples, batch) * batch <= samples);
            }
        }
        assert_eq!(steps_per_epoch(100, 0), 0);
    }

    #[test]
    fn test_zero_steps_rejected() {
        let mut config = RunConfig::default();
        config.data.validation_samples = 10;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = RunConfig::default();
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_image_size_lower_bound() {
        let mut config = RunConfig::default();
        config.data.image_size = ImageDimensions::new(MIN_IMAGE_SIDE, MIN_IMAGE_SIDE, 3);
        assert!(config.validate().is_ok());

        config.data.image_size = ImageDimensions::new(74, 299, 3);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_fine_tune_boundary_range() {
        let mut config = RunConfig::default();
        config.model.fine_tune_boundary = 0;
        assert!(config.validate().is_ok());

        config.model.fine_tune_boundary = BACKBONE_LAYERS - 1;
        assert!(config.validate().is_ok());

        config.model.fine_tune_boundary = BACKBONE_LAYERS;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.model.fine_tune_boundary = 400;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_optimizer_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.warmup.optimizer.learning_rate(), 0.001);
        assert_eq!(config.warmup.optimizer.decay(), 0.0);
        assert_eq!(
            config.fine_tune.optimizer,
            OptimizerConfig::Sgd {
                learning_rate: 0.0001,
                momentum: 0.9,
                decay: 1e-5,
            }
        );
    }

    #[test]
    fn test_pixel_scaling() {
        assert_eq!(PixelScaling::Inception.apply(0), -1.0);
        assert_eq!(PixelScaling::Inception.apply(255), 1.0);
        assert_eq!(PixelScaling::Unit.apply(255), 1.0);
        assert_eq!(PixelScaling::Raw.apply(17), 17.0);
    }

    #[test]
    fn test_invalid_augmentation() {
        let mut aug = AugmentationConfig::default();
        aug.width_shift_range = 1.5;
        assert!(aug.validate().is_err());
        assert!(AugmentationConfig::disabled().is_identity());
        assert!(!AugmentationConfig::default().is_identity());
    }

    #[test]
    fn test_output_paths_are_distinct() {
        let output = OutputConfig::with_root("out");
        assert_eq!(output.csv_log_path(), PathBuf::from("out/logs/training.csv"));
        assert_eq!(
            output.phase_log_dir(TrainingPhase::FineTune),
            PathBuf::from("out/logs/fine_tuning")
        );
        assert_ne!(
            output.weights_path().with_extension("mpk"),
            output.structure_path()
        );
    }

    #[test]
    fn test_partial_toml_override() {
        let config: RunConfig = toml::from_str(
            r#"
            batch_size = 16

            [data]
            train_dir = "/datasets/cats_dogs/train"

            [fine_tune]
            epochs = 5
            early_stopping_patience = 3
            checkpoint_best = true
            csv_log = true

            [fine_tune.optimizer]
            type = "sgd"
            learning_rate = 0.01
            momentum = 0.9
            decay = 0.0
            "#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.fine_tune.epochs, 5);
        assert_eq!(config.fine_tune.optimizer.learning_rate(), 0.01);
        assert_eq!(config.data.train_dir, PathBuf::from("/datasets/cats_dogs/train"));
        // Untouched fields keep their defaults
        assert_eq!(config.data.train_samples, 3064);
        assert_eq!(config.warmup.epochs, 20);
    }
}
