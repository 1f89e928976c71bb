//! Epoch loop shared by both training phases.
//!
//! Each epoch runs a fixed number of optimizer steps over the training
//! stream, then a fixed number of validation batches on the inference copy
//! of the model, then the registered callbacks. Loss is binary
//! cross-entropy on logits; a prediction counts as correct when the logit
//! sign matches the label.

use crate::callbacks::{CallbackAction, EpochCallback};
use crate::lr_schedule::LearningRateScheduler;
use crate::model::LogitsModel;
use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    nn::loss::{BinaryCrossEntropyLoss, BinaryCrossEntropyLossConfig},
    optim::{momentum::MomentumConfig, GradientsParams, Optimizer, RmsPropConfig, SgdConfig},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use colored::Colorize;
use finetune_core::{
    EpochMetrics, ImageDimensions, MetricAccumulator, OptimizerConfig, PhaseConfig, Result,
    TrainingMetrics, TrainingPhase,
};
use finetune_data::{BatchStream, ImageBatch, ImageBatcher};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use tracing::{debug, info};

/// Result of one phase
#[derive(Debug)]
pub struct PhaseOutcome<M> {
    pub model: M,
    pub history: TrainingMetrics,
    /// A callback requested the stop
    pub stopped_early: bool,
    /// Optimizer updates performed
    pub iterations: u64,
    /// Files written by callbacks, in callback order
    pub artifacts: Vec<PathBuf>,
}

pub struct PhaseRunner<B: AutodiffBackend, M> {
    phase: TrainingPhase,
    config: PhaseConfig,
    train_steps: usize,
    validation_steps: usize,
    batcher: ImageBatcher,
    device: B::Device,
    callbacks: Vec<Box<dyn EpochCallback<B, M>>>,
    show_progress: bool,
}

impl<B, M> PhaseRunner<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + LogitsModel<B>,
    M::InnerModule: LogitsModel<B::InnerBackend>,
{
    pub fn new(
        phase: TrainingPhase,
        config: PhaseConfig,
        train_steps: usize,
        validation_steps: usize,
        dims: ImageDimensions,
        device: B::Device,
    ) -> Self {
        Self {
            phase,
            config,
            train_steps,
            validation_steps,
            batcher: ImageBatcher::new(dims),
            device,
            callbacks: Vec::new(),
            show_progress: true,
        }
    }

    /// Callbacks run in the order they are added
    pub fn with_callback(mut self, callback: Box<dyn EpochCallback<B, M>>) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Trains `model` for up to `config.epochs` epochs.
    pub fn run(
        self,
        model: M,
        train: &mut BatchStream,
        validation: &mut BatchStream,
    ) -> Result<PhaseOutcome<M>> {
        info!(
            "Starting {} phase: {} epochs x {} steps, optimizer {}",
            self.phase, self.config.epochs, self.train_steps, self.config.optimizer
        );

        match self.config.optimizer {
            OptimizerConfig::RmsProp { rho, epsilon, .. } => {
                let optimizer = RmsPropConfig::new()
                    .with_alpha(rho)
                    .with_epsilon(epsilon)
                    .init::<B, M>();
                self.run_with(model, optimizer, train, validation)
            }
            OptimizerConfig::Sgd { momentum, .. } => {
                let optimizer = SgdConfig::new()
                    .with_momentum(Some(
                        MomentumConfig::new()
                            .with_momentum(momentum)
                            .with_dampening(0.0),
                    ))
                    .init::<B, M>();
                self.run_with(model, optimizer, train, validation)
            }
        }
    }

    fn run_with<O: Optimizer<M, B>>(
        mut self,
        mut model: M,
        mut optimizer: O,
        train: &mut BatchStream,
        validation: &mut BatchStream,
    ) -> Result<PhaseOutcome<M>> {
        let loss_fn = BinaryCrossEntropyLossConfig::new()
            .with_logits(true)
            .init(&self.device);
        let mut scheduler = LearningRateScheduler::for_optimizer(&self.config.optimizer);
        let mut history = TrainingMetrics::new();
        let mut stopped_early = false;
        let epochs = self.config.epochs;

        for epoch in 0..epochs {
            if self.show_progress {
                println!(
                    "{}",
                    format!("[{}] Epoch {}/{}", self.phase, epoch + 1, epochs)
                        .yellow()
                        .bold()
                );
            }
            let progress = self.progress_bar();
            let mut train_metrics = MetricAccumulator::new();

            for _ in 0..self.train_steps {
                let items = train.next_batch()?;
                let batch: ImageBatch<B> = self.batcher.batch(items, &self.device);
                let batch_size = batch.len();

                let logits = model.logits(batch.images);
                let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
                let loss_value: f64 = loss.clone().into_scalar().elem();
                let correct = count_correct(logits, batch.targets);

                let grads = loss.backward();
                let grads = GradientsParams::from_grads(grads, &model);
                model = optimizer.step(scheduler.get_lr(), model, grads);
                scheduler.step();

                train_metrics.update(loss_value, correct, batch_size);
                progress.set_message(format!(
                    "loss {:.4} acc {:.4}",
                    train_metrics.mean_loss(),
                    train_metrics.accuracy()
                ));
                progress.inc(1);
            }
            progress.finish_and_clear();

            let val_metrics = evaluate(
                &model.valid(),
                validation,
                self.validation_steps,
                &self.batcher,
                &self.device,
            )?;

            let metrics = EpochMetrics {
                epoch,
                loss: train_metrics.mean_loss(),
                accuracy: train_metrics.accuracy(),
                val_loss: val_metrics.mean_loss(),
                val_accuracy: val_metrics.accuracy(),
                learning_rate: scheduler.get_lr(),
            };
            history.add_epoch(metrics);
            info!(
                "Epoch {}: loss={:.4}, acc={:.4}, val_loss={:.4}, val_acc={:.4}, lr={:.3e}",
                epoch + 1,
                metrics.loss,
                metrics.accuracy,
                metrics.val_loss,
                metrics.val_accuracy,
                metrics.learning_rate
            );

            let mut stop = false;
            for callback in self.callbacks.iter_mut() {
                if callback.on_epoch_end(&metrics, &model)? == CallbackAction::Stop {
                    debug!("{} requested stop after epoch {}", callback.name(), epoch + 1);
                    stop = true;
                }
            }
            if stop {
                stopped_early = true;
                break;
            }
        }

        let mut artifacts = Vec::new();
        for callback in self.callbacks.iter_mut() {
            callback.on_train_end()?;
            artifacts.extend(callback.artifacts());
        }

        Ok(PhaseOutcome {
            model,
            history,
            stopped_early,
            iterations: scheduler.iterations(),
            artifacts,
        })
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(self.train_steps as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps {msg} ({eta})")
        {
            progress.set_style(style.progress_chars("=>-"));
        }
        progress
    }
}

/// Mean loss and accuracy over `steps` batches of `stream`.
pub fn evaluate<B: Backend, M: LogitsModel<B>>(
    model: &M,
    stream: &mut BatchStream,
    steps: usize,
    batcher: &ImageBatcher,
    device: &B::Device,
) -> Result<MetricAccumulator> {
    let loss_fn: BinaryCrossEntropyLoss<B> = BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(device);
    let mut metrics = MetricAccumulator::new();

    for _ in 0..steps {
        let items = stream.next_batch()?;
        let batch: ImageBatch<B> = batcher.batch(items, device);
        let batch_size = batch.len();

        let logits = model.logits(batch.images);
        let loss_value: f64 = loss_fn
            .forward(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem();
        metrics.update(loss_value, count_correct(logits, batch.targets), batch_size);
    }

    Ok(metrics)
}

/// Samples whose logit sign agrees with the label
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2, Int>) -> usize {
    let correct: i64 = logits
        .greater_elem(0.0)
        .int()
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::EarlyStopping;
    use burn::backend::Autodiff;
    use burn::module::Module;
    use burn::nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig,
    };
    use burn::tensor::TensorData;
    use burn_ndarray::NdArray;
    use finetune_core::{ImageSample, PixelScaling};
    use finetune_data::ImageLoader;
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    /// Pooled colour channels into one logit
    #[derive(Module, Debug)]
    struct TinyModel<B: Backend> {
        pool: AdaptiveAvgPool2d,
        linear: Linear<B>,
    }

    impl<B: Backend> TinyModel<B> {
        fn new(device: &B::Device) -> Self {
            Self {
                pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
                linear: LinearConfig::new(3, 1).init(device),
            }
        }
    }

    impl<B: Backend> LogitsModel<B> for TinyModel<B> {
        fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
            self.linear.forward(self.pool.forward(images).flatten::<2>(1, 3))
        }
    }

    /// Red images are class 0, blue images class 1
    fn make_samples(dir: &Path, n: usize) -> Vec<ImageSample> {
        (0..n)
            .map(|i| {
                let label = i % 2;
                let color = if label == 0 { [220u8, 10, 10] } else { [10u8, 10, 220] };
                let path = dir.join(format!("{i}.png"));
                image::ImageBuffer::from_fn(8, 8, |_, _| image::Rgb(color))
                    .save(&path)
                    .unwrap();
                ImageSample::new(path, label)
            })
            .collect()
    }

    fn streams(dir: &Path) -> (BatchStream, BatchStream) {
        let dims = ImageDimensions::new(8, 8, 3);
        let samples = make_samples(dir, 8);
        let train = BatchStream::new("train", samples.clone(), ImageLoader::new(dims), 4, 123)
            .unwrap()
            .with_scaling(PixelScaling::Inception);
        let validation = BatchStream::new("validation", samples, ImageLoader::new(dims), 4, 123)
            .unwrap()
            .with_scaling(PixelScaling::Inception);
        (train, validation)
    }

    fn phase(epochs: usize, optimizer: OptimizerConfig, patience: Option<usize>) -> PhaseConfig {
        PhaseConfig {
            epochs,
            optimizer,
            early_stopping_patience: patience,
            checkpoint_best: false,
            csv_log: false,
        }
    }

    fn runner(config: PhaseConfig) -> PhaseRunner<TestAutodiffBackend, TinyModel<TestAutodiffBackend>> {
        PhaseRunner::new(
            TrainingPhase::Warmup,
            config,
            2,
            2,
            ImageDimensions::new(8, 8, 3),
            Default::default(),
        )
        .with_progress(false)
    }

    #[test]
    fn test_count_correct() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_floats(
            TensorData::new(vec![2.0f32, -1.0, 0.5, -3.0], [4, 1]),
            &device,
        );
        let targets = Tensor::<TestBackend, 2, Int>::from_ints(
            TensorData::new(vec![1i64, 0, 0, 1], [4, 1]),
            &device,
        );
        assert_eq!(count_correct(logits, targets), 2);
    }

    #[test]
    fn test_rmsprop_phase_learns_separable_colors() -> Result<()> {
        let temp = TempDir::new().unwrap();
        let (mut train, mut validation) = streams(temp.path());
        let model = TinyModel::<TestAutodiffBackend>::new(&Default::default());

        let config = phase(
            15,
            OptimizerConfig::RmsProp {
                learning_rate: 0.05,
                rho: 0.9,
                epsilon: 1e-7,
            },
            None,
        );
        let outcome = runner(config).run(model, &mut train, &mut validation)?;

        assert_eq!(outcome.history.len(), 15);
        assert_eq!(outcome.iterations, 30);
        assert!(!outcome.stopped_early);
        let first = outcome.history.epochs[0];
        let last = *outcome.history.last().unwrap();
        assert!(last.loss < first.loss);
        assert_eq!(last.val_accuracy, 1.0);
        assert_eq!(last.learning_rate, 0.05);
        Ok(())
    }

    #[test]
    fn test_sgd_phase_decays_learning_rate() -> Result<()> {
        let temp = TempDir::new().unwrap();
        let (mut train, mut validation) = streams(temp.path());
        let model = TinyModel::<TestAutodiffBackend>::new(&Default::default());

        let config = phase(
            3,
            OptimizerConfig::Sgd {
                learning_rate: 0.1,
                momentum: 0.9,
                decay: 0.5,
            },
            None,
        );
        let outcome = runner(config).run(model, &mut train, &mut validation)?;

        let rates: Vec<f64> = outcome.history.epochs.iter().map(|m| m.learning_rate).collect();
        assert!((rates[0] - 0.1 / 2.0).abs() < 1e-12);
        assert!((rates[2] - 0.1 / 4.0).abs() < 1e-12);
        assert_eq!(outcome.iterations, 6);
        Ok(())
    }

    /// Stops once `epoch` has been reached
    struct StopAt(usize);

    impl<B: Backend, M> EpochCallback<B, M> for StopAt {
        fn name(&self) -> &str {
            "stop_at"
        }

        fn on_epoch_end(&mut self, metrics: &EpochMetrics, _model: &M) -> Result<CallbackAction> {
            if metrics.epoch >= self.0 {
                Ok(CallbackAction::Stop)
            } else {
                Ok(CallbackAction::Continue)
            }
        }
    }

    #[test]
    fn test_callback_stop_ends_phase() -> Result<()> {
        let temp = TempDir::new().unwrap();
        let (mut train, mut validation) = streams(temp.path());
        let model = TinyModel::<TestAutodiffBackend>::new(&Default::default());

        let config = phase(
            10,
            OptimizerConfig::Sgd {
                learning_rate: 0.01,
                momentum: 0.9,
                decay: 0.0,
            },
            None,
        );
        let outcome = runner(config)
            .with_callback(Box::new(StopAt(2)))
            .with_callback(Box::new(EarlyStopping::new(5)))
            .run(model, &mut train, &mut validation)?;

        assert!(outcome.stopped_early);
        assert_eq!(outcome.history.len(), 3);
        assert_eq!(outcome.iterations, 6);
        Ok(())
    }

    #[test]
    fn test_early_stopping_ends_phase_on_flat_loss() -> Result<()> {
        let temp = TempDir::new().unwrap();
        let dims = ImageDimensions::new(8, 8, 3);
        let samples: Vec<ImageSample> = (0..4)
            .map(|i| {
                let path = temp.path().join(format!("red_{i}.png"));
                image::ImageBuffer::from_fn(8, 8, |_, _| image::Rgb([220u8, 10, 10]))
                    .save(&path)
                    .unwrap();
                ImageSample::new(path, 0)
            })
            .collect();
        let stream = |name: &str| {
            BatchStream::new(name, samples.clone(), ImageLoader::new(dims), 4, 123)
                .unwrap()
                .with_scaling(PixelScaling::Inception)
        };
        let (mut train, mut validation) = (stream("train"), stream("validation"));
        let model = TinyModel::<TestAutodiffBackend>::new(&Default::default());

        // A zero rate leaves the weights, and so the validation loss, unchanged
        let config = phase(
            10,
            OptimizerConfig::Sgd {
                learning_rate: 0.0,
                momentum: 0.9,
                decay: 0.0,
            },
            Some(2),
        );
        let outcome = runner(config)
            .with_callback(Box::new(EarlyStopping::new(2)))
            .run(model, &mut train, &mut validation)?;

        assert!(outcome.stopped_early);
        assert_eq!(outcome.history.len(), 3);
        assert!(outcome.history.len() < 10);
        assert_eq!(outcome.iterations, 6);
        let losses: Vec<f64> = outcome.history.epochs.iter().map(|m| m.val_loss).collect();
        assert!(losses.iter().all(|l| *l == losses[0]));
        Ok(())
    }

    #[test]
    fn test_stop_on_last_epoch_is_reported() -> Result<()> {
        let temp = TempDir::new().unwrap();
        let (mut train, mut validation) = streams(temp.path());
        let model = TinyModel::<TestAutodiffBackend>::new(&Default::default());

        let config = phase(
            3,
            OptimizerConfig::Sgd {
                learning_rate: 0.01,
                momentum: 0.9,
                decay: 0.0,
            },
            None,
        );
        let outcome = runner(config)
            .with_callback(Box::new(StopAt(2)))
            .run(model, &mut train, &mut validation)?;

        assert!(outcome.stopped_early);
        assert_eq!(outcome.history.len(), 3);
        assert!(outcome.artifacts.is_empty());
        Ok(())
    }
}
