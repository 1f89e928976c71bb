//! Two-phase fine-tuning run.
//!
//! Phase 1 trains the new head on a frozen backbone; phase 2 unfreezes the
//! backbone from the configured layer boundary and continues with a slower
//! optimizer. The batch streams carry on across phases.

use crate::callbacks::{EarlyStopping, EpochCallback};
use crate::checkpoint::BestAccuracyCheckpoint;
use crate::logging::{CsvLogger, ScalarLogger};
use crate::model::{FineTuneModel, LayerGraph};
use crate::persistence::{save_model, SavedModel};
use crate::runner::{PhaseOutcome, PhaseRunner};
use burn::tensor::backend::AutodiffBackend;
use colored::Colorize;
use finetune_core::{
    save_toml_config, Error, PhaseConfig, Result, RunConfig, TrainingMetrics, TrainingPhase,
};
use finetune_data::DataSupply;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Progress of a run; only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Configured,
    DataReady,
    ModelAssembled,
    Phase1Running,
    Phase1Done,
    Phase2Running,
    Phase2Done,
    Phase2EarlyStopped,
    Persisted,
}

impl RunState {
    pub fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Configured, DataReady)
                | (DataReady, ModelAssembled)
                | (ModelAssembled, Phase1Running)
                | (Phase1Running, Phase1Done)
                | (Phase1Done, Phase2Running)
                | (Phase2Running, Phase2Done)
                | (Phase2Running, Phase2EarlyStopped)
                | (Phase2Done, Persisted)
                | (Phase2EarlyStopped, Persisted)
        )
    }

    pub fn advance(&mut self, next: RunState) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(Error::Training(format!(
                "Invalid run state transition {self:?} -> {next:?}"
            )));
        }
        info!("Run state: {:?} -> {:?}", self, next);
        *self = next;
        Ok(())
    }
}

/// What a completed run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub state: RunState,
    /// Phase 2 was ended by early stopping
    pub early_stopped: bool,
    pub warmup: TrainingMetrics,
    pub fine_tune: TrainingMetrics,
    /// Best-accuracy checkpoints, oldest first
    pub checkpoints: Vec<PathBuf>,
    pub model: SavedModel,
    pub config_file: PathBuf,
}

pub struct Pipeline<B: AutodiffBackend> {
    config: RunConfig,
    device: B::Device,
    state: RunState,
    show_progress: bool,
}

impl<B: AutodiffBackend> Pipeline<B> {
    /// Validates `config`; nothing is read or written yet.
    pub fn new(config: RunConfig, device: B::Device) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device,
            state: RunState::Configured,
            show_progress: true,
        })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs data preparation, both phases and persistence.
    pub fn run(mut self) -> Result<RunSummary> {
        let output = self.config.output.clone();
        output.ensure_dirs()?;
        let config_file = output.config_path();
        save_toml_config(&self.config, &config_file)?;

        self.banner("Loading data...");
        let mut supply = DataSupply::new(&self.config)?;
        self.state.advance(RunState::DataReady)?;

        self.banner("Assembling model...");
        let (model, mut graph) = FineTuneModel::<B>::assemble(&self.config.model, &self.device)?;
        self.state.advance(RunState::ModelAssembled)?;

        self.banner("Phase 1: training the classification head");
        self.state.advance(RunState::Phase1Running)?;
        let warmup = self.run_phase(TrainingPhase::Warmup, model, &mut supply)?;
        self.state.advance(RunState::Phase1Done)?;

        self.banner("Phase 2: fine-tuning the top of the backbone");
        let boundary = self.config.model.fine_tune_boundary;
        let mut model = warmup.model;
        model.unfreeze_from(&mut graph, boundary)?;
        log_trainable(&graph, boundary);
        self.state.advance(RunState::Phase2Running)?;
        let fine_tune = self.run_phase(TrainingPhase::FineTune, model, &mut supply)?;
        let early_stopped = fine_tune.stopped_early;
        self.state.advance(if early_stopped {
            RunState::Phase2EarlyStopped
        } else {
            RunState::Phase2Done
        })?;

        self.banner("Saving model...");
        let saved = save_model(&fine_tune.model, &graph, &self.config)?;
        self.state.advance(RunState::Persisted)?;

        if let Some(best) = fine_tune.history.best_val_accuracy() {
            info!("Best fine-tuning val_acc: {:.4}", best);
        }

        Ok(RunSummary {
            state: self.state,
            early_stopped,
            warmup: warmup.history,
            fine_tune: fine_tune.history,
            checkpoints: fine_tune.artifacts,
            model: saved,
            config_file,
        })
    }

    fn run_phase(
        &self,
        phase: TrainingPhase,
        model: FineTuneModel<B>,
        supply: &mut DataSupply,
    ) -> Result<PhaseOutcome<FineTuneModel<B>>> {
        let phase_config = match phase {
            TrainingPhase::Warmup => &self.config.warmup,
            TrainingPhase::FineTune => &self.config.fine_tune,
        };

        let mut runner = PhaseRunner::new(
            phase,
            phase_config.clone(),
            self.config.train_steps(),
            self.config.validation_steps(),
            self.config.data.image_size,
            self.device.clone(),
        )
        .with_progress(self.show_progress);
        for callback in self.callbacks(phase, phase_config)? {
            runner = runner.with_callback(callback);
        }

        runner.run(model, &mut supply.train, &mut supply.validation)
    }

    /// CSV log, best-accuracy checkpoint, early stopping, scalar log
    fn callbacks(
        &self,
        phase: TrainingPhase,
        phase_config: &PhaseConfig,
    ) -> Result<Vec<Box<dyn EpochCallback<B, FineTuneModel<B>>>>> {
        let output = &self.config.output;
        let mut callbacks: Vec<Box<dyn EpochCallback<B, FineTuneModel<B>>>> = Vec::new();

        if phase_config.csv_log {
            callbacks.push(Box::new(CsvLogger::create(output.csv_log_path())?));
        }
        if phase_config.checkpoint_best {
            callbacks.push(Box::new(BestAccuracyCheckpoint::new(output.checkpoint_dir())));
        }
        if let Some(patience) = phase_config.early_stopping_patience {
            callbacks.push(Box::new(EarlyStopping::new(patience)));
        }
        callbacks.push(Box::new(ScalarLogger::create(
            output.phase_log_dir(phase),
            phase,
        )?));

        Ok(callbacks)
    }

    fn banner(&self, message: &str) {
        if self.show_progress {
            println!("{}", message.cyan().bold());
        }
        info!("{}", message);
    }
}

fn log_trainable(graph: &LayerGraph, boundary: usize) {
    let (trainable, frozen) = graph.param_layer_counts();
    let name = graph.get(boundary).map(|l| l.name.as_str()).unwrap_or("?");
    info!(
        "Unfroze layers from {} ({}): {} trainable / {} frozen parameter layers",
        boundary, name, trainable, frozen
    );
}
