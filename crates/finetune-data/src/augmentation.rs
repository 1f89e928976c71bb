//! Random geometric augmentation for training images.
//!
//! Each image gets a random rotation and translation, resampled bilinearly.
//! Source coordinates falling outside the image are clamped to the nearest
//! edge pixel. Flips are applied after the affine warp.

use finetune_core::AugmentationConfig;
use image::{ImageBuffer, Rgb, RgbImage};
use rand::Rng;

/// Transform parameters drawn for a single image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineParams {
    /// Counter-clockwise rotation in degrees
    pub rotation_deg: f32,
    /// Horizontal shift in pixels
    pub shift_x: f32,
    /// Vertical shift in pixels
    pub shift_y: f32,
    pub flip_horizontal: bool,
    pub flip_vertical: bool,
}

impl AffineParams {
    pub fn identity() -> Self {
        Self {
            rotation_deg: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            flip_horizontal: false,
            flip_vertical: false,
        }
    }

    fn has_warp(&self) -> bool {
        self.rotation_deg != 0.0 || self.shift_x != 0.0 || self.shift_y != 0.0
    }
}

/// Draws and applies random augmentations
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Draws transform parameters for an image of the given size.
    pub fn sample_params<R: Rng + ?Sized>(&self, rng: &mut R, width: u32, height: u32) -> AffineParams {
        let mut params = AffineParams::identity();

        if self.config.rotation_range > 0.0 {
            let range = self.config.rotation_range;
            params.rotation_deg = rng.gen_range(-range..=range);
        }
        if self.config.width_shift_range > 0.0 {
            let range = self.config.width_shift_range;
            params.shift_x = rng.gen_range(-range..=range) * width as f32;
        }
        if self.config.height_shift_range > 0.0 {
            let range = self.config.height_shift_range;
            params.shift_y = rng.gen_range(-range..=range) * height as f32;
        }
        if self.config.horizontal_flip {
            params.flip_horizontal = rng.gen_bool(0.5);
        }
        if self.config.vertical_flip {
            params.flip_vertical = rng.gen_bool(0.5);
        }

        params
    }

    /// Applies a random augmentation drawn from `rng`
    pub fn augment<R: Rng + ?Sized>(&self, image: &RgbImage, rng: &mut R) -> RgbImage {
        let params = self.sample_params(rng, image.width(), image.height());
        apply(image, &params)
    }
}

/// Applies fixed transform parameters to an image.
pub fn apply(image: &RgbImage, params: &AffineParams) -> RgbImage {
    let mut out = if params.has_warp() {
        warp(image, params)
    } else {
        image.clone()
    };

    if params.flip_horizontal {
        out = image::imageops::flip_horizontal(&out);
    }
    if params.flip_vertical {
        out = image::imageops::flip_vertical(&out);
    }

    out
}

/// Maps every output pixel back to its source location and samples it.
fn warp(image: &RgbImage, params: &AffineParams) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    let cx = (width as f32 - 1.0) / 2.0;
    let cy = (height as f32 - 1.0) / 2.0;
    let (sin, cos) = params.rotation_deg.to_radians().sin_cos();

    ImageBuffer::from_fn(width, height, |x, y| {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let src_x = cos * dx - sin * dy + cx - params.shift_x;
        let src_y = sin * dx + cos * dy + cy - params.shift_y;
        sample_bilinear(image, src_x, src_y)
    })
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let max_x = image.width() - 1;
    let max_y = image.height() - 1;
    let x = x.clamp(0.0, max_x as f32);
    let y = y.clamp(0.0, max_y as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(max_x);
    let y1 = (y0 + 1).min(max_y);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0);
    let p10 = image.get_pixel(x1, y0);
    let p01 = image.get_pixel(x0, y1);
    let p11 = image.get_pixel(x1, y1);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
        let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}
