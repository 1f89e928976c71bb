//! Epoch metrics and training history.

use serde::{Deserialize, Serialize};

/// Metrics reported at the end of one epoch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EpochMetrics {
    /// Zero-based epoch index within its phase
    pub epoch: usize,
    /// Mean training loss
    pub loss: f64,
    /// Training accuracy
    pub accuracy: f64,
    /// Mean validation loss
    pub val_loss: f64,
    /// Validation accuracy
    pub val_accuracy: f64,
    /// Learning rate in effect at the end of the epoch
    pub learning_rate: f64,
}

/// Running, sample-weighted loss and accuracy over a sequence of batches.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    samples: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one batch: `mean_loss` is the batch mean, `correct` the number
    /// of samples whose thresholded prediction matched the label.
    pub fn update(&mut self, mean_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += mean_loss * batch_size as f64;
        self.correct += correct;
        self.samples += batch_size;
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn mean_loss(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.loss_sum / self.samples as f64
    }

    pub fn accuracy(&self) -> f64 {
        if self.samples == 0 {
            return 0.0;
        }
        self.correct as f64 / self.samples as f64
    }
}

/// Per-phase training history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds metrics for an epoch
    pub fn add_epoch(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Gets the best validation accuracy
    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.epochs
            .iter()
            .map(|m| m.val_accuracy)
            .max_by(|a, b| a.total_cmp(b))
    }

    /// Gets the lowest validation loss
    pub fn best_val_loss(&self) -> Option<f64> {
        self.epochs
            .iter()
            .map(|m| m.val_loss)
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Gets the epoch with best validation accuracy (first one on ties)
    pub fn best_epoch(&self) -> Option<usize> {
        let best = self.best_val_accuracy()?;
        self.epochs
            .iter()
            .find(|m| m.val_accuracy == best)
            .map(|m| m.epoch)
    }
}
