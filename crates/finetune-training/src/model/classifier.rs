//! InceptionV3 backbone with a binary classification head.
//!
//! The head is global average pooling, a ReLU dense layer and a single-unit
//! output. The model returns logits; the sigmoid is folded into the loss and
//! only applied explicitly by [`FineTuneModel::predict_proba`].

use super::graph::{LayerGraph, LayerGraphBuilder, LayerKind, ModelPart};
use super::inception::{InceptionV3, InceptionV3Config, FEATURE_CHANNELS};
use burn::{
    config::Config,
    module::Module,
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Initializer, Linear, LinearConfig,
    },
    record::CompactRecorder,
    tensor::{
        activation::{relu, sigmoid},
        backend::Backend,
        Tensor,
    },
};
use finetune_core::{Error, ModelConfig};
use std::path::Path;
use tracing::{info, warn};

/// Forward pass producing one logit per sample.
///
/// The epoch runner only needs this, which keeps it usable with any model.
pub trait LogitsModel<B: Backend> {
    /// `[N, C, H, W]` -> `[N, 1]`
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

#[derive(Config, Debug)]
pub struct FineTuneModelConfig {
    #[config(default = "InceptionV3Config::new()")]
    pub backbone: InceptionV3Config,

    /// Units of the hidden dense layer
    #[config(default = "1024")]
    pub head_units: usize,
}

#[derive(Module, Debug)]
pub struct FineTuneModel<B: Backend> {
    pub backbone: InceptionV3<B>,
    pool: AdaptiveAvgPool2d,
    pub dense: Linear<B>,
    pub output: Linear<B>,
    dense_index: usize,
    output_index: usize,
}

impl FineTuneModelConfig {
    /// Builds the model and the layer graph describing it.
    ///
    /// Every layer starts out trainable.
    pub fn init<B: Backend>(&self, device: &B::Device) -> (FineTuneModel<B>, LayerGraph) {
        let mut graph = LayerGraphBuilder::new();

        graph.enter(ModelPart::Backbone);
        let backbone = self.backbone.init(&mut graph, device);

        graph.enter(ModelPart::Head);
        graph.push(LayerKind::GlobalAvgPool);
        let pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();

        let dense = LinearConfig::new(FEATURE_CHANNELS, self.head_units)
            .with_initializer(Initializer::XavierUniform { gain: 1.0 })
            .init(device);
        let dense_index = graph.push(LayerKind::Dense);

        let output = LinearConfig::new(self.head_units, 1)
            .with_initializer(Initializer::XavierUniform { gain: 1.0 })
            .init(device);
        let output_index = graph.push(LayerKind::Dense);

        let model = FineTuneModel {
            backbone,
            pool,
            dense,
            output,
            dense_index,
            output_index,
        };
        (model, graph.build())
    }
}

impl<B: Backend> FineTuneModel<B> {
    /// Builds the model for a run, loads the ImageNet backbone if configured
    /// and freezes the whole backbone.
    pub fn assemble(
        config: &ModelConfig,
        device: &B::Device,
    ) -> finetune_core::Result<(Self, LayerGraph)> {
        let (model, mut graph) = FineTuneModelConfig::new()
            .with_head_units(config.head_units)
            .init::<B>(device);

        let mut model = match &config.pretrained_weights {
            Some(path) => model.load_backbone(path, device)?,
            None => {
                warn!("No pretrained weights configured, backbone starts from random initialization");
                model
            }
        };
        model.freeze_backbone(&mut graph);

        let (trainable, frozen) = graph.param_layer_counts();
        info!(
            "Assembled {} layers: {} trainable / {} frozen parameter layers",
            graph.len(),
            trainable,
            frozen
        );
        Ok((model, graph))
    }

    /// `[N, 3, H, W]` -> logits `[N, 1]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images);
        let pooled = self.pool.forward(features).flatten::<2>(1, 3);
        let hidden = relu(self.dense.forward(pooled));
        self.output.forward(hidden)
    }

    /// Probability of class 1, `[N, 1]`
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images))
    }

    /// Replaces the backbone parameters with an ImageNet record.
    pub fn load_backbone(mut self, path: &Path, device: &B::Device) -> finetune_core::Result<Self> {
        self.backbone = self
            .backbone
            .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
            .map_err(|e| Error::Model(format!("Failed to load backbone weights from {path:?}: {e}")))?;
        info!("Loaded backbone weights from {:?}", path);
        Ok(self)
    }

    /// Freezes every backbone layer and leaves the head trainable.
    pub fn freeze_backbone(&mut self, graph: &mut LayerGraph) {
        graph.set_part_trainable(ModelPart::Backbone, false);
        graph.set_part_trainable(ModelPart::Head, true);
        self.apply_trainable(graph);
    }

    /// Freezes layers below `boundary` and unfreezes the rest.
    pub fn unfreeze_from(&mut self, graph: &mut LayerGraph, boundary: usize) -> finetune_core::Result<()> {
        graph.set_trainable_from(boundary)?;
        self.apply_trainable(graph);
        Ok(())
    }

    /// Syncs parameter gradient tracking with the graph's flags.
    pub fn apply_trainable(&mut self, graph: &LayerGraph) {
        self.backbone.apply_trainable(graph);
        set_linear_trainable(&mut self.dense, graph.is_trainable(self.dense_index));
        set_linear_trainable(&mut self.output, graph.is_trainable(self.output_index));
    }
}

impl<B: Backend> LogitsModel<B> for FineTuneModel<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

fn set_linear_trainable<B: Backend>(linear: &mut Linear<B>, trainable: bool) {
    linear.weight = linear.weight.clone().set_require_grad(trainable);
    linear.bias = linear.bias.take().map(|b| b.set_require_grad(trainable));
}
