//! Shared image preprocessing utilities
//!
//! Letterboxing of uploaded photos onto the square working canvas, and
//! conversion of canvases into normalized NCHW tensors for model backends.

use crate::error::{Result, TryOnError};
use image::{imageops::FilterType, ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;

/// Tensor layout expected by a model input
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationConfig {
    /// Square input side
    pub target_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for NormalizationConfig {
    /// ImageNet statistics, used by the human-parsing models
    fn default() -> Self {
        Self {
            target_size: 512,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

/// Placement of the original image inside a letterboxed canvas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub size: u32,
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub content_width: u32,
    pub content_height: u32,
}

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Fit `image` into a `size` x `size` canvas, aspect preserved and centered
    ///
    /// An image that already has the canvas size is returned unchanged.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn letterbox(
        image: &RgbImage,
        size: u32,
        padding_color: [u8; 3],
    ) -> Result<(RgbImage, Letterbox)> {
        let (orig_width, orig_height) = image.dimensions();
        if orig_width == 0 || orig_height == 0 || size == 0 {
            return Err(TryOnError::invalid_input("cannot letterbox an empty image"));
        }
        if (orig_width, orig_height) == (size, size) {
            return Ok((
                image.clone(),
                Letterbox {
                    size,
                    scale: 1.0,
                    offset_x: 0,
                    offset_y: 0,
                    content_width: size,
                    content_height: size,
                },
            ));
        }

        let size_f32 = size as f32;
        let scale = (size_f32 / orig_width as f32).min(size_f32 / orig_height as f32);
        let new_width = ((orig_width as f32 * scale).round() as u32).clamp(1, size);
        let new_height = ((orig_height as f32 * scale).round() as u32).clamp(1, size);

        let resized =
            image::imageops::resize(image, new_width, new_height, FilterType::Lanczos3);
        let mut canvas: RgbImage = ImageBuffer::from_pixel(size, size, Rgb(padding_color));

        let offset_x = (size - new_width) / 2;
        let offset_y = (size - new_height) / 2;
        image::imageops::replace(&mut canvas, &resized, i64::from(offset_x), i64::from(offset_y));

        Ok((
            canvas,
            Letterbox {
                size,
                scale,
                offset_x,
                offset_y,
                content_width: new_width,
                content_height: new_height,
            },
        ))
    }

    /// Stretch to the model input size and normalize into an NCHW tensor
    ///
    /// Outputs at model resolution line up with the input by plain scaling.
    pub fn to_tensor(image: &RgbImage, config: &NormalizationConfig) -> Result<Array4<f32>> {
        let size = config.target_size;
        if size == 0 {
            return Err(TryOnError::internal("model input size is zero"));
        }
        if config.std.iter().any(|s| *s == 0.0) {
            return Err(TryOnError::internal("normalization std must be non-zero"));
        }
        let resized;
        let canvas = if image.dimensions() == (size, size) {
            image
        } else {
            resized = image::imageops::resize(image, size, size, FilterType::Triangle);
            &resized
        };

        let side = size as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        for (y, row) in canvas.rows().enumerate() {
            for (x, pixel) in row.enumerate() {
                for c in 0..3 {
                    tensor[[0, c, y, x]] =
                        (f32::from(pixel[c]) / 255.0 - config.mean[c]) / config.std[c];
                }
            }
        }
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_portrait_is_centered_on_white() {
        let image = RgbImage::from_pixel(50, 100, Rgb([255, 0, 0]));
        let (canvas, placement) = ImagePreprocessor::letterbox(&image, 64, [255, 255, 255]).unwrap();

        assert_eq!(canvas.dimensions(), (64, 64));
        assert_eq!(placement.content_width, 32);
        assert_eq!(placement.content_height, 64);
        assert_eq!(placement.offset_x, 16);
        assert_eq!(canvas.get_pixel(0, 32).0, [255, 255, 255]);
        assert_eq!(canvas.get_pixel(32, 32).0, [255, 0, 0]);
    }

    #[test]
    fn test_letterbox_exact_size_is_identity() {
        let image = RgbImage::from_fn(32, 32, |x, y| Rgb([x as u8, y as u8, 7]));
        let (canvas, placement) = ImagePreprocessor::letterbox(&image, 32, [0, 0, 0]).unwrap();
        assert_eq!(canvas, image);
        assert!((placement.scale - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_letterbox_rejects_empty() {
        let err = ImagePreprocessor::letterbox(&RgbImage::new(0, 10), 32, [0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_tensor_shape_and_normalization() {
        let image = RgbImage::from_pixel(10, 20, Rgb([255, 0, 0]));
        let config = NormalizationConfig {
            target_size: 16,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        };
        let tensor = ImagePreprocessor::to_tensor(&image, &config).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 16, 16]);
        assert!((tensor[[0, 0, 8, 8]] - 1.0).abs() < 1e-5);
        assert!((tensor[[0, 1, 8, 8]] + 1.0).abs() < 1e-5);
    }
}
