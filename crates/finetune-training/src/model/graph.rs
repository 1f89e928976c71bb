//! Flat layer graph with per-layer trainable flags.
//!
//! Layers are registered in construction order and numbered from zero,
//! matching the layer indices of the published ImageNet InceptionV3 graph:
//! every conv+batch-norm+activation unit contributes three layers, pooling
//! and concatenation one each. Only
//! convolution, batch-norm and dense layers own parameters; the flag of any
//! other layer is informational.

use finetune_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Input,
    Conv2d,
    BatchNorm,
    Activation,
    MaxPool,
    AvgPool,
    Concatenate,
    GlobalAvgPool,
    Dense,
}

impl LayerKind {
    /// Base name for automatic naming (`conv2d`, `conv2d_1`, ...)
    pub fn base_name(&self) -> &'static str {
        match self {
            LayerKind::Input => "input",
            LayerKind::Conv2d => "conv2d",
            LayerKind::BatchNorm => "batch_normalization",
            LayerKind::Activation => "activation",
            LayerKind::MaxPool => "max_pooling2d",
            LayerKind::AvgPool => "average_pooling2d",
            LayerKind::Concatenate => "concatenate",
            LayerKind::GlobalAvgPool => "global_average_pooling2d",
            LayerKind::Dense => "dense",
        }
    }

    pub fn has_params(&self) -> bool {
        matches!(self, LayerKind::Conv2d | LayerKind::BatchNorm | LayerKind::Dense)
    }
}

/// Which part of the assembled model a layer belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelPart {
    Backbone,
    Head,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LayerInfo {
    pub index: usize,
    pub name: String,
    pub kind: LayerKind,
    pub part: ModelPart,
    pub trainable: bool,
}

/// Allocates layer indices and names while a model is being constructed.
#[derive(Debug, Default)]
pub struct LayerGraphBuilder {
    layers: Vec<LayerInfo>,
    name_counts: BTreeMap<&'static str, usize>,
    part: Option<ModelPart>,
}

impl LayerGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subsequent layers belong to `part`
    pub fn enter(&mut self, part: ModelPart) {
        self.part = Some(part);
    }

    /// Registers an automatically named layer (`conv2d`, `conv2d_1`, ...).
    pub fn push(&mut self, kind: LayerKind) -> usize {
        let base = kind.base_name();
        let count = self.name_counts.entry(base).or_insert(0);
        let name = if *count == 0 {
            base.to_string()
        } else {
            format!("{base}_{count}")
        };
        *count += 1;
        self.push_named(kind, name)
    }

    /// Registers a layer with an explicit name (`mixed0`, `mixed9_1`, ...).
    pub fn push_named(&mut self, kind: LayerKind, name: impl Into<String>) -> usize {
        let index = self.layers.len();
        self.layers.push(LayerInfo {
            index,
            name: name.into(),
            kind,
            part: self.part.unwrap_or(ModelPart::Backbone),
            trainable: true,
        });
        index
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn build(self) -> LayerGraph {
        LayerGraph {
            layers: self.layers,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LayerGraph {
    layers: Vec<LayerInfo>,
}

impl LayerGraph {
    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LayerInfo> {
        self.layers.get(index)
    }

    pub fn is_trainable(&self, index: usize) -> bool {
        self.layers.get(index).map(|l| l.trainable).unwrap_or(false)
    }

    /// Number of layers in `part`
    pub fn part_len(&self, part: ModelPart) -> usize {
        self.layers.iter().filter(|l| l.part == part).count()
    }

    pub fn set_part_trainable(&mut self, part: ModelPart, trainable: bool) {
        for layer in self.layers.iter_mut().filter(|l| l.part == part) {
            layer.trainable = trainable;
        }
    }

    /// Freezes every layer below `boundary` and unfreezes every layer at or
    /// above it.
    pub fn set_trainable_from(&mut self, boundary: usize) -> Result<()> {
        if boundary >= self.layers.len() {
            return Err(Error::InvalidArgument(format!(
                "Layer boundary {boundary} is outside the graph ({} layers)",
                self.layers.len()
            )));
        }
        for layer in &mut self.layers {
            layer.trainable = layer.index >= boundary;
        }
        Ok(())
    }

    pub fn trainable_flags(&self) -> Vec<bool> {
        self.layers.iter().map(|l| l.trainable).collect()
    }

    /// Counts of (trainable, frozen) parameter-bearing layers
    pub fn param_layer_counts(&self) -> (usize, usize) {
        self.layers
            .iter()
            .filter(|l| l.kind.has_params())
            .fold((0, 0), |(t, f), l| if l.trainable { (t + 1, f) } else { (t, f + 1) })
    }
}
