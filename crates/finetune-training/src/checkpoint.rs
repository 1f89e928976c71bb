//! Best-model checkpointing.
//!
//! Whenever validation accuracy reaches a new maximum the model weights are
//! written to `inception_v3_{epoch:02}_{val_acc:.2}.mpk` (one-based epoch)
//! together with a JSON sidecar describing the epoch. Paths handed to the
//! recorder carry the `.mpk` extension explicitly since the stem itself
//! contains a dot.

use crate::callbacks::{CallbackAction, EpochCallback};
use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use finetune_core::{EpochMetrics, Error, Result, MODEL_NAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Description of one saved checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMetadata {
    pub model_name: String,
    /// One-based epoch
    pub epoch: usize,
    pub val_accuracy: f64,
    pub val_loss: f64,
    pub learning_rate: f64,
    pub timestamp: String,
    /// Weights file, including the `.mpk` extension
    pub weights_file: PathBuf,
}

impl CheckpointMetadata {
    pub fn new(metrics: &EpochMetrics, weights_file: PathBuf) -> Self {
        use chrono::Utc;

        Self {
            model_name: MODEL_NAME.to_string(),
            epoch: metrics.epoch + 1,
            val_accuracy: metrics.val_accuracy,
            val_loss: metrics.val_loss,
            learning_rate: metrics.learning_rate,
            timestamp: Utc::now().to_rfc3339(),
            weights_file,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize checkpoint: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Checkpoint file stem for an epoch, e.g. `inception_v3_07_0.93`
pub fn checkpoint_stem(metrics: &EpochMetrics) -> String {
    format!(
        "{MODEL_NAME}_{:02}_{:.2}",
        metrics.epoch + 1,
        metrics.val_accuracy
    )
}

/// Saves the model each time validation accuracy strictly improves.
pub struct BestAccuracyCheckpoint {
    checkpoint_dir: PathBuf,
    best_accuracy: f64,
    saved: Vec<CheckpointMetadata>,
}

impl BestAccuracyCheckpoint {
    pub fn new(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            best_accuracy: f64::NEG_INFINITY,
            saved: Vec::new(),
        }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    pub fn best_accuracy(&self) -> f64 {
        self.best_accuracy
    }

    /// Checkpoints written so far, oldest first
    pub fn saved(&self) -> &[CheckpointMetadata] {
        &self.saved
    }

    /// Most recent, and therefore best, checkpoint
    pub fn best(&self) -> Option<&CheckpointMetadata> {
        self.saved.last()
    }

    fn is_improvement(&self, val_accuracy: f64) -> bool {
        val_accuracy > self.best_accuracy
    }
}

impl<B: Backend, M: Module<B>> EpochCallback<B, M> for BestAccuracyCheckpoint {
    fn name(&self) -> &str {
        "best_accuracy_checkpoint"
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics, model: &M) -> Result<CallbackAction> {
        if !self.is_improvement(metrics.val_accuracy) {
            return Ok(CallbackAction::Continue);
        }

        fs::create_dir_all(&self.checkpoint_dir)?;
        let stem = checkpoint_stem(metrics);
        let weights_file = self.checkpoint_dir.join(format!("{stem}.mpk"));

        model
            .clone()
            .save_file(weights_file.clone(), &CompactRecorder::new())
            .map_err(|e| Error::Model(format!("Failed to save checkpoint {weights_file:?}: {e:?}")))?;

        let metadata = CheckpointMetadata::new(metrics, weights_file);
        metadata.save(&self.checkpoint_dir.join(format!("{stem}.json")))?;

        info!(
            "val_acc improved from {:.4} to {:.4}, saved {:?}",
            self.best_accuracy, metrics.val_accuracy, metadata.weights_file
        );
        self.best_accuracy = metrics.val_accuracy;
        self.saved.push(metadata);

        Ok(CallbackAction::Continue)
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        self.saved.iter().map(|m| m.weights_file.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn metrics(epoch: usize, val_accuracy: f64) -> EpochMetrics {
        EpochMetrics {
            epoch,
            loss: 0.4,
            accuracy: 0.8,
            val_loss: 0.5,
            val_accuracy,
            learning_rate: 1e-4,
        }
    }

    #[test]
    fn test_checkpoint_stem() {
        assert_eq!(checkpoint_stem(&metrics(0, 0.8125)), "inception_v3_01_0.81");
        assert_eq!(checkpoint_stem(&metrics(11, 0.9)), "inception_v3_12_0.90");
    }

    #[test]
    fn test_metadata_written_as_json() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("meta.json");

        let original = CheckpointMetadata::new(&metrics(4, 0.9), PathBuf::from("w.mpk"));
        original.save(&path)?;
        let loaded: CheckpointMetadata = serde_json::from_str(&fs::read_to_string(&path)?)?;

        assert_eq!(loaded, original);
        assert_eq!(loaded.epoch, 5);
        Ok(())
    }

    #[test]
    fn test_saves_only_on_strict_improvement() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let device = Default::default();
        let model: Linear<TestBackend> = LinearConfig::new(4, 1).init(&device);

        let mut checkpoint = BestAccuracyCheckpoint::new(temp_dir.path().join("checkpoints"));
        for (epoch, acc) in [0.6, 0.7, 0.7, 0.65, 0.8].iter().enumerate() {
            let action = EpochCallback::<TestBackend, _>::on_epoch_end(
                &mut checkpoint,
                &metrics(epoch, *acc),
                &model,
            )?;
            assert_eq!(action, CallbackAction::Continue);
        }

        let epochs: Vec<usize> = checkpoint.saved().iter().map(|m| m.epoch).collect();
        assert_eq!(epochs, vec![1, 2, 5]);
        assert_eq!(checkpoint.best_accuracy(), 0.8);

        for saved in checkpoint.saved() {
            assert!(saved.weights_file.exists());
        }
        let dir = temp_dir.path().join("checkpoints");
        assert!(dir.join("inception_v3_01_0.60.mpk").exists());
        assert!(dir.join("inception_v3_01_0.60.json").exists());
        assert!(!dir.join("inception_v3_03_0.70.mpk").exists());

        let best = checkpoint.best().unwrap();
        assert!(best.weights_file.ends_with("inception_v3_05_0.80.mpk"));

        // The saved weights load back into the same architecture
        let _restored: Linear<TestBackend> = LinearConfig::new(4, 1)
            .init(&device)
            .load_file(best.weights_file.clone(), &CompactRecorder::new(), &device)
            .unwrap();
        Ok(())
    }
}
