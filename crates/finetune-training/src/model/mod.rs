//! InceptionV3 transfer-learning model.

pub mod classifier;
pub mod graph;
pub mod inception;

pub use classifier::{FineTuneModel, FineTuneModelConfig, LogitsModel};
pub use graph::{LayerGraph, LayerGraphBuilder, LayerInfo, LayerKind, ModelPart};
pub use inception::{BasicConv2d, InceptionV3, InceptionV3Config, FEATURE_CHANNELS};
