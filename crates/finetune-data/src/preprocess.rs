//! Conversion of decoded images into network input values.

use finetune_core::PixelScaling;
use image::RgbImage;

/// Flattens an RGB image into CHW order, scaling every channel value.
pub fn to_chw_tensor(image: &RgbImage, scaling: PixelScaling) -> Vec<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in image.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        data[offset] = scaling.apply(pixel[0]);
        data[plane + offset] = scaling.apply(pixel[1]);
        data[2 * plane + offset] = scaling.apply(pixel[2]);
    }

    data
}
