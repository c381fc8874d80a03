//! Image preprocessing for model inference.
//!
//! Uploaded bytes are decoded once into a 224x224 RGB image. From that image
//! the pipeline derives one tensor per pixel scale it needs: the relevance
//! detector always sees 0-1 values, classifiers see whatever scale their
//! family was trained on.

use crate::error::{PipelineError, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Side length of the square model input.
pub const IMAGE_SIZE: u32 = 224;
/// Color channels of the model input.
pub const CHANNELS: usize = 3;
/// NHWC model input shape with a batch of one.
pub const INPUT_SHAPE: [usize; 4] = [1, IMAGE_SIZE as usize, IMAGE_SIZE as usize, CHANNELS];
/// Upload extensions the service accepts.
pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Number of scalar elements in one model input.
pub const fn input_len() -> usize {
    INPUT_SHAPE[0] * INPUT_SHAPE[1] * INPUT_SHAPE[2] * INPUT_SHAPE[3]
}

/// Pixel value range fed to a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelScale {
    /// Raw intensities, 0.0 - 255.0
    #[default]
    Raw,
    /// Intensities divided by 255, 0.0 - 1.0
    Unit,
}

impl PixelScale {
    fn divisor(self) -> f32 {
        match self {
            PixelScale::Raw => 1.0,
            PixelScale::Unit => 255.0,
        }
    }
}

/// Check whether a file name carries an accepted upload extension.
pub fn is_supported_image<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

/// Fixed-shape `[1, 224, 224, 3]` float tensor handed to models.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Array4<f32>,
}

impl ImageTensor {
    /// Build a tensor from NHWC-ordered values.
    pub fn from_vec(values: Vec<f32>) -> Result<Self> {
        let actual = vec![values.len()];
        let data = Array4::from_shape_vec(INPUT_SHAPE, values).map_err(|_| PipelineError::Shape {
            expected: INPUT_SHAPE.to_vec(),
            actual,
        })?;
        Ok(Self { data })
    }

    /// Convert a 224x224 RGB image at the given pixel scale.
    pub fn from_rgb(image: &RgbImage, scale: PixelScale) -> Result<Self> {
        let (width, height) = image.dimensions();
        if width != IMAGE_SIZE || height != IMAGE_SIZE {
            return Err(PipelineError::Shape {
                expected: INPUT_SHAPE.to_vec(),
                actual: vec![1, height as usize, width as usize, CHANNELS],
            });
        }

        let divisor = scale.divisor();
        let data = Array4::from_shape_fn(INPUT_SHAPE, |(_, y, x, c)| {
            image.get_pixel(x as u32, y as u32)[c] as f32 / divisor
        });
        Ok(Self { data })
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Values in NHWC order.
    pub fn values(&self) -> impl Iterator<Item = f32> + '_ {
        self.data.iter().copied()
    }

    pub fn to_array(&self) -> Array4<f32> {
        self.data.clone()
    }

    /// Mean of squared elementwise differences against a flat output of the
    /// same element count.
    pub fn mean_squared_error(&self, other: &[f32]) -> Result<f64> {
        if other.len() != self.len() {
            return Err(PipelineError::Shape {
                expected: INPUT_SHAPE.to_vec(),
                actual: vec![other.len()],
            });
        }

        let sum: f64 = self
            .data
            .iter()
            .zip(other)
            .map(|(&a, &b)| {
                let diff = a as f64 - b as f64;
                diff * diff
            })
            .sum();
        Ok(sum / self.len() as f64)
    }
}

/// Decoded, resized upload ready to be turned into tensors
#[derive(Debug, Clone)]
pub struct PreparedImage {
    rgb: RgbImage,
    original_dimensions: (u32, u32),
}

impl PreparedImage {
    /// Tensor at the requested pixel scale.
    pub fn tensor(&self, scale: PixelScale) -> Result<ImageTensor> {
        ImageTensor::from_rgb(&self.rgb, scale)
    }

    /// Width and height of the upload before resizing.
    pub fn original_dimensions(&self) -> (u32, u32) {
        self.original_dimensions
    }
}

/// Decodes uploads and resizes them to the model input size.
#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    size: u32,
    filter: FilterType,
}

impl ImagePreprocessor {
    pub fn new() -> Self {
        Self {
            size: IMAGE_SIZE,
            // Bicubic, same family as the resampling the models were trained with
            filter: FilterType::CatmullRom,
        }
    }

    /// Decode PNG/JPEG bytes, force three channels, resize to 224x224.
    pub fn prepare(&self, bytes: &[u8]) -> Result<PreparedImage> {
        let decoded = image::load_from_memory(bytes)?;
        let original_dimensions = (decoded.width(), decoded.height());

        let rgb = decoded.to_rgb8();
        let rgb = if rgb.dimensions() == (self.size, self.size) {
            rgb
        } else {
            imageops::resize(&rgb, self.size, self.size, self.filter)
        };

        Ok(PreparedImage {
            rgb,
            original_dimensions,
        })
    }
}

impl Default for ImagePreprocessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::png_bytes;

    #[test]
    fn test_prepare_resizes_to_input_shape() {
        let preprocessor = ImagePreprocessor::new();
        let prepared = preprocessor.prepare(&png_bytes(50, 30, [10, 20, 30])).unwrap();

        assert_eq!(prepared.original_dimensions(), (50, 30));
        let tensor = prepared.tensor(PixelScale::Unit).unwrap();
        assert_eq!(tensor.shape(), &INPUT_SHAPE);
        assert_eq!(tensor.len(), input_len());
    }

    #[test]
    fn test_pixel_scales() {
        let preprocessor = ImagePreprocessor::new();
        let prepared = preprocessor
            .prepare(&png_bytes(IMAGE_SIZE, IMAGE_SIZE, [255, 255, 255]))
            .unwrap();

        let raw = prepared.tensor(PixelScale::Raw).unwrap();
        let unit = prepared.tensor(PixelScale::Unit).unwrap();
        assert!(raw.values().all(|v| v == 255.0));
        assert!(unit.values().all(|v| v == 1.0));
    }

    #[test]
    fn test_channel_order_is_rgb() {
        let preprocessor = ImagePreprocessor::new();
        let prepared = preprocessor
            .prepare(&png_bytes(IMAGE_SIZE, IMAGE_SIZE, [255, 0, 51]))
            .unwrap();

        let values: Vec<f32> = prepared.tensor(PixelScale::Raw).unwrap().values().take(3).collect();
        assert_eq!(values, vec![255.0, 0.0, 51.0]);
    }

    #[test]
    fn test_undecodable_bytes() {
        let err = ImagePreprocessor::new().prepare(b"definitely not a jpeg").unwrap_err();
        assert!(matches!(err, PipelineError::Decode(_)));
    }

    #[test]
    fn test_tensor_shape_is_checked() {
        let err = ImageTensor::from_vec(vec![0.0; 10]).unwrap_err();
        assert!(matches!(err, PipelineError::Shape { .. }));

        let small = RgbImage::new(32, 32);
        let err = ImageTensor::from_rgb(&small, PixelScale::Raw).unwrap_err();
        assert!(matches!(err, PipelineError::Shape { actual, .. } if actual == vec![1, 32, 32, 3]));
    }

    #[test]
    fn test_mean_squared_error() {
        let tensor = ImageTensor::from_vec(vec![1.0; input_len()]).unwrap();
        assert_eq!(tensor.mean_squared_error(&vec![1.0; input_len()]).unwrap(), 0.0);
        assert_eq!(tensor.mean_squared_error(&vec![0.5; input_len()]).unwrap(), 0.25);
        assert!(tensor.mean_squared_error(&[1.0, 1.0]).is_err());
    }

    #[test]
    fn test_supported_extensions() {
        assert!(is_supported_image("cow.JPG"));
        assert!(is_supported_image("dir/cow.png"));
        assert!(!is_supported_image("cow.gif"));
        assert!(!is_supported_image("README"));
    }
}
