//! Fine-tuning CLI Tool
//!
//! Trains a binary InceptionV3 classifier in two phases: the new head on a
//! frozen backbone, then the top inception blocks together with the head.

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use finetune_core::{
    backend_name, default_device, load_toml_config, setup_cli_logging, RunConfig,
    TrainingBackend,
};
use finetune_data::DataSupply;
use finetune_training::{Pipeline, RunSummary};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "finetune")]
#[command(author, version, about = "Two-phase InceptionV3 fine-tuning for binary image classification")]
struct Args {
    /// TOML file overriding the built-in run configuration
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the training directory
    #[arg(long, value_name = "DIR")]
    train_dir: Option<PathBuf>,

    /// Override the validation directory
    #[arg(long, value_name = "DIR")]
    validation_dir: Option<PathBuf>,

    /// Override the output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override the batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Start the backbone from random weights instead of ImageNet
    #[arg(long)]
    no_pretrained: bool,

    /// Hide the per-epoch progress bars
    #[arg(long)]
    no_progress: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Check the configuration and dataset without training
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    info!("InceptionV3 Fine-Tuning");
    info!("=======================");

    let mut config = match &args.config {
        Some(path) => load_toml_config::<RunConfig>(path)
            .with_context(|| format!("Failed to load configuration file {}", path.display()))?,
        None => RunConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    print_config_summary(&config);

    if args.dry_run {
        let supply = DataSupply::new(&config).context("Failed to prepare the dataset")?;
        info!(
            "Dry run: {} training / {} validation images across {} classes",
            supply.train.num_samples(),
            supply.validation.num_samples(),
            supply.classes().len()
        );
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    let summary = Pipeline::<TrainingBackend>::new(config, default_device())?
        .with_progress(!args.no_progress)
        .run()
        .context("Fine-tuning run failed")?;

    print_run_summary(&summary);
    Ok(())
}

fn apply_overrides(config: &mut RunConfig, args: &Args) {
    if let Some(ref dir) = args.train_dir {
        config.data.train_dir = dir.clone();
    }
    if let Some(ref dir) = args.validation_dir {
        config.data.validation_dir = dir.clone();
    }
    if let Some(ref output) = args.output {
        config.output.root = output.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if args.no_pretrained {
        config.model.pretrained_weights = None;
    }
}

fn print_config_summary(config: &RunConfig) {
    let dims = config.data.image_size;
    info!("");
    info!("Configuration Summary:");
    info!("  Backend: {}", backend_name());
    info!("  Train dir: {}", config.data.train_dir.display());
    info!("  Validation dir: {}", config.data.validation_dir.display());
    info!("  Image size: {}x{}x{}", dims.width, dims.height, dims.channels);
    info!("  Batch size: {}", config.batch_size);
    info!(
        "  Steps per epoch: {} train / {} validation",
        config.train_steps(),
        config.validation_steps()
    );
    match &config.model.pretrained_weights {
        Some(path) => info!("  Backbone weights: {}", path.display()),
        None => info!("  Backbone weights: random initialization"),
    }
    info!("  Head units: {}", config.model.head_units);
    info!("  Fine-tune boundary: layer {}", config.model.fine_tune_boundary);
    info!("  Warm-up: {} epochs, {}", config.warmup.epochs, config.warmup.optimizer);
    info!(
        "  Fine-tuning: {} epochs, {}",
        config.fine_tune.epochs, config.fine_tune.optimizer
    );
    if let Some(patience) = config.fine_tune.early_stopping_patience {
        info!("  Early stopping patience: {}", patience);
    }
    info!("  Output dir: {}", config.output.root.display());
    info!("");
}

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Fine-tuning complete".green().bold());
    println!("  Warm-up epochs:      {}", summary.warmup.len());
    let stop_note = if summary.early_stopped {
        " (early stopped)".yellow().to_string()
    } else {
        String::new()
    };
    println!("  Fine-tuning epochs:  {}{}", summary.fine_tune.len(), stop_note);

    if let Some(last) = summary.fine_tune.last() {
        println!(
            "  Final:               val_loss {:.4}, val_acc {:.2}%",
            last.val_loss,
            last.val_accuracy * 100.0
        );
    }
    if let Some(best) = summary.fine_tune.best_val_accuracy() {
        println!("  Best val accuracy:   {:.2}%", best * 100.0);
    }
    println!("  Checkpoints:         {}", summary.checkpoints.len());
    println!("  Weights:             {}", summary.model.weights_file.display());
    println!("  Structure:           {}", summary.model.structure_file.display());
    println!("  Run config:          {}", summary.config_file.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_overrides_applied() {
        let args = Args::parse_from([
            "finetune",
            "--train-dir",
            "data/train",
            "--output",
            "runs/a",
            "--batch-size",
            "16",
            "--no-pretrained",
        ]);

        let mut config = RunConfig::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.data.train_dir, PathBuf::from("data/train"));
        assert_eq!(config.output.root, PathBuf::from("runs/a"));
        assert_eq!(config.batch_size, 16);
        assert!(config.model.pretrained_weights.is_none());
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let args = Args::parse_from(["finetune"]);
        let mut config = RunConfig::default();
        apply_overrides(&mut config, &args);

        let defaults = RunConfig::default();
        assert_eq!(config.batch_size, defaults.batch_size);
        assert_eq!(config.data.train_dir, defaults.data.train_dir);
        assert_eq!(config.model.pretrained_weights, defaults.model.pretrained_weights);
    }
}
