//! Burn batching of preprocessed images.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use finetune_core::ImageDimensions;

/// One preprocessed image and its binary label
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// Image data as flattened CHW float array [3 * H * W]
    pub image: Vec<f32>,
    /// Class label (0 or 1)
    pub label: usize,
}

/// A batch of images ready for the model
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// Shape [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// Shape [batch_size, 1]
    pub targets: Tensor<B, 2, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stacks [`ImageItem`]s into tensors on a device
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    dims: ImageDimensions,
}

impl ImageBatcher {
    pub fn new(dims: ImageDimensions) -> Self {
        Self { dims }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let channels = self.dims.channels as usize;
        let height = self.dims.height as usize;
        let width = self.dims.width as usize;

        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let images_data: Vec<f32> = items.into_iter().flat_map(|item| item.image).collect();

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );
        let targets = Tensor::<B, 2, Int>::from_data(
            TensorData::new(labels, [batch_size, 1]),
            device,
        );

        ImageBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_batch_shapes() {
        let dims = ImageDimensions::new(4, 3, 3);
        let items: Vec<ImageItem> = (0..5)
            .map(|i| ImageItem {
                image: vec![i as f32; dims.num_values()],
                label: i % 2,
            })
            .collect();

        let batcher = ImageBatcher::new(dims);
        let device = Default::default();
        let batch: ImageBatch<TestBackend> = batcher.batch(items, &device);

        assert_eq!(batch.images.dims(), [5, 3, 3, 4]);
        assert_eq!(batch.targets.dims(), [5, 1]);
        assert_eq!(batch.len(), 5);

        let labels: Vec<i64> = batch.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(labels, vec![0, 1, 0, 1, 0]);
    }
}
