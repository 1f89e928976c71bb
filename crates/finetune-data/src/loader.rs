//! Image file discovery and decoding.

use finetune_core::{Error, ImageDimensions, Result};
use image::imageops::FilterType;
use image::{ImageReader, RgbImage};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions recognised as image files (lowercase)
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// Returns true if the path has a recognised image extension.
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Recursively collects image files below `dir`, sorted by path.
pub fn scan_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Err(Error::NotFound(format!(
            "Directory not found: {}",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "Path is not a directory: {}",
            dir.display()
        )));
    }

    let mut images = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(true) {
        let entry = entry.map_err(|e| Error::Dataset(format!("Failed to walk {}: {e}", dir.display())))?;
        if entry.file_type().is_file() && is_image_file(entry.path()) {
            images.push(entry.into_path());
        }
    }
    images.sort();

    Ok(images)
}

/// Decodes images and resizes them to the network input size
#[derive(Debug, Clone, Copy)]
pub struct ImageLoader {
    size: ImageDimensions,
}

impl ImageLoader {
    pub fn new(size: ImageDimensions) -> Self {
        Self { size }
    }

    pub fn size(&self) -> ImageDimensions {
        self.size
    }

    /// Loads an RGB image resized exactly to the configured size
    pub fn load(&self, path: &Path) -> Result<RgbImage> {
        let img = ImageReader::open(path)
            .map_err(|e| Error::Image(format!("Failed to open image {}: {e}", path.display())))?
            .with_guessed_format()
            .map_err(|e| Error::Image(format!("Failed to read image {}: {e}", path.display())))?
            .decode()
            .map_err(|e| Error::Image(format!("Failed to decode image {}: {e}", path.display())))?;

        let rgb = img.to_rgb8();
        if rgb.dimensions() == (self.size.width, self.size.height) {
            return Ok(rgb);
        }

        Ok(image::imageops::resize(
            &rgb,
            self.size.width,
            self.size.height,
            FilterType::Triangle,
        ))
    }
}
