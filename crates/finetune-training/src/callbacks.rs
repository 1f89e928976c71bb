//! End-of-epoch hooks.
//!
//! The epoch runner calls every registered callback once per epoch, in
//! registration order, after validation. Any callback may ask the runner to
//! stop; the remaining callbacks of that epoch still run.

use burn::tensor::backend::Backend;
use finetune_core::{EpochMetrics, Result};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

pub trait EpochCallback<B: Backend, M> {
    fn name(&self) -> &str;

    fn on_epoch_end(&mut self, metrics: &EpochMetrics, model: &M) -> Result<CallbackAction>;

    /// Called once after the last epoch of the phase.
    fn on_train_end(&mut self) -> Result<()> {
        Ok(())
    }

    /// Files this callback wrote during the phase
    fn artifacts(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Stops training once validation loss has not decreased for `patience`
/// consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best_loss: f64,
    best_epoch: Option<usize>,
    patience_counter: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_loss: f64::INFINITY,
            best_epoch: None,
            patience_counter: 0,
            stopped_epoch: None,
        }
    }

    /// Records one epoch's validation loss; returns true on improvement.
    pub fn update(&mut self, epoch: usize, val_loss: f64) -> bool {
        let improved = val_loss < self.best_loss;
        if improved {
            info!(
                "Validation loss improved from {:.4} to {:.4}",
                self.best_loss, val_loss
            );
            self.best_loss = val_loss;
            self.best_epoch = Some(epoch);
            self.patience_counter = 0;
        } else {
            self.patience_counter += 1;
            info!(
                "No improvement. Patience: {}/{}",
                self.patience_counter, self.patience
            );
        }

        if self.should_stop() && self.stopped_epoch.is_none() {
            self.stopped_epoch = Some(epoch);
        }
        improved
    }

    pub fn should_stop(&self) -> bool {
        self.patience_counter >= self.patience
    }

    pub fn best_loss(&self) -> f64 {
        self.best_loss
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// Epoch at which the stop was requested
    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }
}

impl<B: Backend, M> EpochCallback<B, M> for EarlyStopping {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics, _model: &M) -> Result<CallbackAction> {
        self.update(metrics.epoch, metrics.val_loss);
        if self.should_stop() {
            info!(
                "Early stopping at epoch {}: no improvement for {} epochs",
                metrics.epoch + 1,
                self.patience
            );
            Ok(CallbackAction::Stop)
        } else {
            Ok(CallbackAction::Continue)
        }
    }

    fn on_train_end(&mut self) -> Result<()> {
        if let Some(epoch) = self.stopped_epoch {
            info!("Stopped early after epoch {}", epoch + 1);
        }
        if let Some(best) = self.best_epoch {
            info!("Best val_loss {:.4} at epoch {}", self.best_loss, best + 1);
        }
        Ok(())
    }
}
