//! Slice-level image helpers: intensity scaling, power-of-two downsampling and
//! PNG overlays for visual checks of masks.

use std::path::Path;

use image::{GrayImage, ImageBuffer, Luma, imageops::FilterType};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImagingError {
    #[error(
        "cannot downsample {height}x{width} slices by {factor}: sizes, factor and result must be powers of two"
    )]
    InvalidDownsample {
        height: usize,
        width: usize,
        factor: usize,
    },

    #[error("expected {expected} values for shape {shape:?}, got {actual}")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("image error: `{0}`")]
    Image(#[from] image::ImageError),
}

pub fn power_of_two(n: usize) -> bool {
    n.is_power_of_two()
}

/// Downsample every slice of a `[depth, height, width]` stack by `factor`
/// with bicubic (Catmull-Rom) interpolation.
///
/// Set `round` for label maps so interpolated values snap back to integers.
pub fn downsample_images(
    images: &[f32],
    shape: [usize; 3],
    factor: usize,
    round: bool,
) -> Result<(Vec<f32>, [usize; 3]), ImagingError> {
    let [depth, height, width] = shape;
    check_len(images, &shape)?;

    let valid = power_of_two(height)
        && power_of_two(width)
        && power_of_two(factor)
        && factor <= height
        && factor <= width;
    if !valid {
        return Err(ImagingError::InvalidDownsample {
            height,
            width,
            factor,
        });
    }

    let (new_height, new_width) = (height / factor, width / factor);
    tracing::info!(
        "Slices have {}x{} pixels, downsizing to {}x{}",
        height,
        width,
        new_height,
        new_width
    );

    let mut output = Vec::with_capacity(depth * new_height * new_width);
    for slice in images.chunks_exact(height * width) {
        // the resize filter works on [0, 1] float pixels
        let (min, max) = min_max(slice);
        let range = max - min;
        if !(range > 0.0) {
            output.extend(std::iter::repeat_n(min, new_height * new_width));
            continue;
        }

        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(width as u32, height as u32, scale_image(slice)).ok_or(
                ImagingError::ShapeMismatch {
                    shape: vec![height, width],
                    expected: height * width,
                    actual: slice.len(),
                },
            )?;
        let resized = image::imageops::resize(
            &buffer,
            new_width as u32,
            new_height as u32,
            FilterType::CatmullRom,
        );

        let restored = resized
            .into_raw()
            .into_iter()
            .map(|value| value.clamp(0.0, 1.0) * range + min);
        if round {
            output.extend(restored.map(f32::round));
        } else {
            output.extend(restored);
        }
    }

    Ok((output, [depth, new_height, new_width]))
}

/// All strictly positive values, in order.
pub fn nonzero_entries(values: &[f32]) -> Vec<f32> {
    values.iter().copied().filter(|&value| value > 0.0).collect()
}

/// Min-max scale to `[0, 1]`. A constant input maps to zeros.
pub fn scale_image(values: &[f32]) -> Vec<f32> {
    let (min, max) = min_max(values);
    let range = max - min;

    if !(range > 0.0) {
        return vec![0.0; values.len()];
    }

    values.iter().map(|&value| (value - min) / range).collect()
}

/// Save a side-by-side PNG of a slice, its ground truth and the two blended.
///
/// The blend paints every voxel with `truth >= 0.5` white on top of the
/// scaled slice.
pub fn save_overlay(
    image: &[f32],
    truth: &[f32],
    height: usize,
    width: usize,
    path: &Path,
) -> Result<(), ImagingError> {
    check_len(image, &[height, width])?;
    check_len(truth, &[height, width])?;

    let scaled = scale_image(image);
    let to_u8 = |value: f32| (value.clamp(0.0, 1.0) * 255.0).round() as u8;

    let overlay = GrayImage::from_fn((3 * width) as u32, height as u32, |x, y| {
        let (panel, column) = (x as usize / width, x as usize % width);
        let index = y as usize * width + column;
        let is_truth = truth[index] >= 0.5;

        let value = match panel {
            0 => to_u8(scaled[index]),
            1 if is_truth => u8::MAX,
            1 => 0,
            _ if is_truth => u8::MAX,
            _ => to_u8(scaled[index]),
        };
        Luma([value])
    });

    overlay.save(path)?;
    Ok(())
}

fn min_max(values: &[f32]) -> (f32, f32) {
    values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &value| {
            (min.min(value), max.max(value))
        })
}

fn check_len(values: &[f32], shape: &[usize]) -> Result<(), ImagingError> {
    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(ImagingError::ShapeMismatch {
            shape: shape.to_vec(),
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}
