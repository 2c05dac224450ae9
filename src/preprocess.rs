use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgb32FImage};
use ndarray::{Array3, ArrayView3};

use crate::error::{CovisError, Result};

/// Convert a decoded image into a `(3, height, width)` RGB tensor in `[0, 1]`.
pub fn tensor_from_image(img: &DynamicImage) -> Array3<f32> {
    tensor_from_rgb(&img.to_rgb32f())
}

fn tensor_from_rgb(rgb: &Rgb32FImage) -> Array3<f32> {
    let (width, height) = rgb.dimensions();
    let mut tensor = Array3::<f32>::zeros((3, height as usize, width as usize));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[c, y as usize, x as usize]] = pixel[c];
        }
    }
    tensor
}

fn rgb_from_tensor(image: ArrayView3<f32>) -> Result<Rgb32FImage> {
    let (_, height, width) = image.dim();
    let (width, height) = match (u32::try_from(width), u32::try_from(height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => {
            return Err(CovisError::InvalidImage(format!(
                "{height}x{width} exceeds the supported image size"
            )))
        }
    };
    let mut rgb = Rgb32FImage::new(width, height);
    for (x, y, pixel) in rgb.enumerate_pixels_mut() {
        for c in 0..3 {
            pixel[c] = image[[c, y as usize, x as usize]];
        }
    }
    Ok(rgb)
}

/// Resize a decoded image so both sides are multiples of `patch_size`, then
/// convert it to a tensor.
pub fn prepare_image(img: &DynamicImage, patch_size: usize) -> Result<Array3<f32>> {
    if patch_size == 0 {
        return Err(CovisError::InvalidConfig("patch_size must be non-zero".into()));
    }
    let (width, height) = img.dimensions();
    let new_width = patch_multiple(width as usize, patch_size) as u32;
    let new_height = patch_multiple(height as usize, patch_size) as u32;

    if new_width == width && new_height == height {
        return Ok(tensor_from_image(img));
    }
    let resized = img.resize_exact(new_width, new_height, FilterType::Triangle);
    Ok(tensor_from_image(&resized))
}

/// Largest multiple of `patch` not above `len`, but never less than one patch.
pub fn patch_multiple(len: usize, patch: usize) -> usize {
    ((len / patch) * patch).max(patch)
}

/// Resample a `(3, H, W)` tensor so `H` and `W` are multiples of
/// `patch_size`, using the same triangle filter as [`prepare_image`].
/// Compliant tensors are returned unchanged.
///
/// Values are expected in `[0, 1]`; resampled values are clamped to it.
pub fn resize_to_patch_multiple(image: ArrayView3<f32>, patch_size: usize) -> Result<Array3<f32>> {
    if patch_size == 0 {
        return Err(CovisError::InvalidConfig("patch_size must be non-zero".into()));
    }
    let (channels, height, width) = image.dim();
    if channels != 3 {
        return Err(CovisError::InvalidImage(format!(
            "expected 3 channels, got {channels}"
        )));
    }
    if height == 0 || width == 0 {
        return Err(CovisError::InvalidImage(format!(
            "image has zero extent ({height}x{width})"
        )));
    }

    let new_height = patch_multiple(height, patch_size);
    let new_width = patch_multiple(width, patch_size);
    if new_height == height && new_width == width {
        return Ok(image.to_owned());
    }

    let rgb = rgb_from_tensor(image)?;
    let resized = imageops::resize(&rgb, new_width as u32, new_height as u32, FilterType::Triangle);
    Ok(tensor_from_rgb(&resized))
}
