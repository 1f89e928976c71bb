//! Final model artifacts.
//!
//! Weights go to `<output>/inception_v3_finetuned.mpk` through the compact
//! recorder; the architecture description goes to a separate
//! `<output>/inception_v3_finetuned.json`.

use crate::model::{FineTuneModel, FineTuneModelConfig, LayerGraph, LayerInfo};
use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use finetune_core::{Error, ImageDimensions, OutputConfig, Result, RunConfig, MODEL_NAME};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Architecture description written next to the weights
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelStructure {
    pub model_name: String,
    pub input_shape: ImageDimensions,
    pub head_units: usize,
    pub num_layers: usize,
    /// Index of the first layer trained in phase 2
    pub fine_tune_boundary: usize,
    pub layers: Vec<LayerInfo>,
    pub created_at: String,
}

impl ModelStructure {
    pub fn new(graph: &LayerGraph, config: &RunConfig) -> Self {
        Self {
            model_name: MODEL_NAME.to_string(),
            input_shape: config.data.image_size,
            head_units: config.model.head_units,
            num_layers: graph.len(),
            fine_tune_boundary: config.model.fine_tune_boundary,
            layers: graph.layers().to_vec(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!("Model structure file {path:?}")));
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Paths of the persisted model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedModel {
    pub weights_file: PathBuf,
    pub structure_file: PathBuf,
}

/// Writes the trained weights and the structure description.
pub fn save_model<B: Backend, M: Module<B>>(
    model: &M,
    graph: &LayerGraph,
    config: &RunConfig,
) -> Result<SavedModel> {
    let output = &config.output;
    fs::create_dir_all(&output.root)?;

    let weights_stem = output.weights_path();
    model
        .clone()
        .save_file(weights_stem.clone(), &CompactRecorder::new())
        .map_err(|e| Error::Model(format!("Failed to save model: {e:?}")))?;
    let weights_file = weights_stem.with_extension("mpk");

    let structure_file = output.structure_path();
    ModelStructure::new(graph, config).save(&structure_file)?;

    info!("Saved weights to {:?}", weights_file);
    info!("Saved model structure to {:?}", structure_file);
    Ok(SavedModel {
        weights_file,
        structure_file,
    })
}

/// Rebuilds the architecture described in `output` and loads its weights.
pub fn load_model<B: Backend>(
    output: &OutputConfig,
    device: &B::Device,
) -> Result<(FineTuneModel<B>, ModelStructure)> {
    let structure = ModelStructure::load(&output.structure_path())?;

    let (model, _) = FineTuneModelConfig::new()
        .with_head_units(structure.head_units)
        .init::<B>(device);
    let model = model
        .load_file(output.weights_path(), &CompactRecorder::new(), device)
        .map_err(|e| Error::Model(format!("Failed to load model weights: {e:?}")))?;

    info!("Loaded {} from {:?}", structure.model_name, output.root);
    Ok((model, structure))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_save_and_reload_model() -> Result<()> {
        let temp = TempDir::new().unwrap();
        let device = Default::default();

        let mut config = RunConfig::default();
        config.output = OutputConfig::with_root(temp.path().join("output"));
        config.data.image_size = ImageDimensions::new(75, 75, 3);
        config.model.head_units = 16;

        let (mut model, mut graph) = FineTuneModelConfig::new()
            .with_head_units(16)
            .init::<TestBackend>(&device);
        model.unfreeze_from(&mut graph, 249)?;

        let saved = save_model(&model, &graph, &config)?;
        assert!(saved.weights_file.ends_with("inception_v3_finetuned.mpk"));
        assert!(saved.structure_file.ends_with("inception_v3_finetuned.json"));
        assert!(saved.weights_file.exists());
        assert!(saved.structure_file.exists());
        assert_ne!(saved.weights_file, saved.structure_file);

        let (restored, structure) = load_model::<TestBackend>(&config.output, &device)?;
        assert_eq!(structure.num_layers, 314);
        assert_eq!(structure.head_units, 16);
        assert_eq!(structure.input_shape, ImageDimensions::new(75, 75, 3));
        assert!(!structure.layers[248].trainable);
        assert!(structure.layers[249].trainable);

        // The compact recorder stores half precision
        let close = |a: Tensor<TestBackend, 2>, b: Tensor<TestBackend, 2>| {
            let a: Vec<f32> = a.into_data().to_vec().unwrap();
            let b: Vec<f32> = b.into_data().to_vec().unwrap();
            a.len() == b.len() && a.iter().zip(&b).all(|(x, y)| (x - y).abs() <= 1e-3 * x.abs().max(1.0))
        };
        assert!(close(model.dense.weight.val(), restored.dense.weight.val()));
        assert!(close(model.output.weight.val(), restored.output.weight.val()));

        let stem = model.backbone.stem().conv.weight.val().flatten::<2>(0, 2);
        let restored_stem = restored.backbone.stem().conv.weight.val().flatten::<2>(0, 2);
        assert!(close(stem, restored_stem));
        Ok(())
    }

    #[test]
    fn test_missing_structure_file() {
        let temp = TempDir::new().unwrap();
        let output = OutputConfig::with_root(temp.path());
        let result = load_model::<TestBackend>(&output, &Default::default());
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
