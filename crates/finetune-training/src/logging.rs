//! Per-epoch metric logs.
//!
//! `CsvLogger` writes the semicolon-separated history of a phase
//! (`epoch;acc;loss;val_acc;val_loss`, zero-based epochs). `ScalarLogger`
//! appends one timestamped JSON object per epoch to
//! `<logs>/<phase>/scalars.jsonl`.

use crate::callbacks::{CallbackAction, EpochCallback};
use burn::tensor::backend::Backend;
use finetune_core::{EpochMetrics, Error, Result, TrainingPhase};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CSV_HEADER: [&str; 5] = ["epoch", "acc", "loss", "val_acc", "val_loss"];

/// Semicolon-separated epoch history; truncates any existing file.
pub struct CsvLogger {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvLogger {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_path(&path)
            .map_err(csv_error)?;
        writer.write_record(CSV_HEADER).map_err(csv_error)?;
        writer.flush()?;

        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, metrics: &EpochMetrics) -> Result<()> {
        self.writer
            .write_record([
                metrics.epoch.to_string(),
                metrics.accuracy.to_string(),
                metrics.loss.to_string(),
                metrics.val_accuracy.to_string(),
                metrics.val_loss.to_string(),
            ])
            .map_err(csv_error)?;
        self.writer.flush()?;
        Ok(())
    }
}

impl<B: Backend, M> EpochCallback<B, M> for CsvLogger {
    fn name(&self) -> &str {
        "csv_logger"
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics, _model: &M) -> Result<CallbackAction> {
        self.log(metrics)?;
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn csv_error(e: csv::Error) -> Error {
    Error::Serialization(format!("CSV log: {e}"))
}

/// One line of `scalars.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalarRecord {
    pub timestamp: String,
    pub phase: String,
    pub epoch: usize,
    pub loss: f64,
    pub acc: f64,
    pub val_loss: f64,
    pub val_acc: f64,
    pub lr: f64,
}

impl ScalarRecord {
    pub fn new(phase: TrainingPhase, metrics: &EpochMetrics) -> Self {
        Self {
            timestamp: chrono::Local::now().to_rfc3339(),
            phase: phase.log_dir_name().to_string(),
            epoch: metrics.epoch,
            loss: metrics.loss,
            acc: metrics.accuracy,
            val_loss: metrics.val_loss,
            val_acc: metrics.val_accuracy,
            lr: metrics.learning_rate,
        }
    }
}

/// Appends epoch scalars as JSON lines under a phase log directory.
pub struct ScalarLogger {
    phase: TrainingPhase,
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ScalarLogger {
    pub const FILE_NAME: &'static str = "scalars.jsonl";

    pub fn create(log_dir: impl AsRef<Path>, phase: TrainingPhase) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)?;

        let path = log_dir.join(Self::FILE_NAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Scalar log for {} at {:?}", phase, path);

        Ok(Self {
            phase,
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, metrics: &EpochMetrics) -> Result<()> {
        let record = ScalarRecord::new(self.phase, metrics);
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Reads every record of a scalar log.
    pub fn read(path: &Path) -> Result<Vec<ScalarRecord>> {
        fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Error::from))
            .collect()
    }
}

impl<B: Backend, M> EpochCallback<B, M> for ScalarLogger {
    fn name(&self) -> &str {
        "scalar_logger"
    }

    fn on_epoch_end(&mut self, metrics: &EpochMetrics, _model: &M) -> Result<CallbackAction> {
        self.log(metrics)?;
        Ok(CallbackAction::Continue)
    }

    fn on_train_end(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
