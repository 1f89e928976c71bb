//! Two-phase transfer learning of InceptionV3 for binary classification.
//!
//! This crate provides:
//! - The InceptionV3 backbone, classification head and layer graph
//! - An epoch runner with RMSprop / SGD and inverse-time decay
//! - Callbacks: early stopping, best-accuracy checkpoints, CSV and scalar logs
//! - Persistence of the final weights and structure
//! - The pipeline driving both phases

pub mod callbacks;
pub mod checkpoint;
pub mod logging;
pub mod lr_schedule;
pub mod model;
pub mod persistence;
pub mod pipeline;
pub mod runner;

pub use callbacks::{CallbackAction, EarlyStopping, EpochCallback};
pub use checkpoint::{BestAccuracyCheckpoint, CheckpointMetadata};
pub use logging::{CsvLogger, ScalarLogger, ScalarRecord};
pub use lr_schedule::{LearningRateScheduler, SchedulerType};
pub use model::{FineTuneModel, FineTuneModelConfig, LayerGraph, LogitsModel};
pub use persistence::{load_model, save_model, ModelStructure, SavedModel};
pub use pipeline::{Pipeline, RunState, RunSummary};
pub use runner::{PhaseOutcome, PhaseRunner};

/// Re-export commonly used types
pub mod prelude {
    pub use super::model::{FineTuneModel, FineTuneModelConfig, LayerGraph};
    pub use super::pipeline::{Pipeline, RunState, RunSummary};
    pub use super::runner::{PhaseOutcome, PhaseRunner};
}
