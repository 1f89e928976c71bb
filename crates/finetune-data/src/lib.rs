//! Directory-based image data supply.
//!
//! This crate discovers class-labelled images on disk, augments training
//! images and turns both splits into unbounded, reproducible batch streams
//! that batch into Burn tensors.

pub mod augmentation;
pub mod batcher;
pub mod dataset;
pub mod loader;
pub mod preprocess;
pub mod stream;
pub mod supply;

pub use augmentation::{AffineParams, Augmenter};
pub use batcher::{ImageBatch, ImageBatcher, ImageItem};
pub use dataset::ClassDirectory;
pub use loader::{is_image_file, scan_images, ImageLoader};
pub use preprocess::to_chw_tensor;
pub use stream::BatchStream;
pub use supply::DataSupply;
