//! Float RGB image tensors and the conversions between pipeline stages.
//!
//! Pixels are stored HWC, three channels, normalized to [0, 1]. Model
//! backends get a batch dimension of one on top of that layout.

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use ndarray::Array4;
use std::path::Path;
use thiserror::Error;

/// Luminance weights for RGB → grayscale. Must stay exact for reproducible scores.
pub const GRAY_WEIGHTS: [f32; 3] = [0.2989, 0.5870, 0.1140];

const CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum PixelError {
    #[error(
        "tensor length mismatch: expected {expected} values for {width}x{height}x3, got {actual}"
    )]
    ShapeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

/// An RGB image with `f32` samples in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl ImageTensor {
    /// Wrap HWC RGB samples. Values are taken as-is; call [`clipped`](Self::clipped)
    /// on raw model output.
    pub fn from_hwc(width: u32, height: u32, data: Vec<f32>) -> Result<Self, PixelError> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(PixelError::ShapeMismatch {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { width, height, data })
    }

    /// Build from CHW planes (channel-first model output).
    pub fn from_chw(width: u32, height: u32, planes: &[f32]) -> Result<Self, PixelError> {
        let plane = width as usize * height as usize;
        let expected = plane * CHANNELS;
        if planes.len() != expected {
            return Err(PixelError::ShapeMismatch {
                width,
                height,
                expected,
                actual: planes.len(),
            });
        }
        let mut data = Vec::with_capacity(expected);
        for i in 0..plane {
            for c in 0..CHANNELS {
                data.push(planes[c * plane + i]);
            }
        }
        Ok(Self { width, height, data })
    }

    /// Convert an 8-bit RGB image, scaling to [0, 1].
    pub fn from_rgb8(img: &RgbImage) -> Self {
        let data = img.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        Self {
            width: img.width(),
            height: img.height(),
            data,
        }
    }

    /// Load any common raster format, resize to `size`×`size`, scale to [0, 1].
    ///
    /// Nearest-neighbour resampling, matching how the reconstruction model
    /// was fed during training.
    pub fn load(path: &Path, size: u32) -> Result<Self, PixelError> {
        let rgb = image::open(path)?.to_rgb8();
        let resized = if rgb.width() == size && rgb.height() == size {
            rgb
        } else {
            image::imageops::resize(&rgb, size, size, FilterType::Nearest)
        };
        Ok(Self::from_rgb8(&resized))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw HWC samples.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Clamp every sample into [0, 1]. NaN becomes 0.
    pub fn clipped(mut self) -> Self {
        for v in self.data.iter_mut() {
            *v = if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) };
        }
        self
    }

    /// Luminance plane using [`GRAY_WEIGHTS`].
    pub fn grayscale(&self) -> Vec<f32> {
        self.data
            .chunks_exact(CHANNELS)
            .map(|px| px[0] * GRAY_WEIGHTS[0] + px[1] * GRAY_WEIGHTS[1] + px[2] * GRAY_WEIGHTS[2])
            .collect()
    }

    /// Batch-of-one NHWC tensor `[1, H, W, 3]`.
    pub fn to_nhwc(&self) -> Array4<f32> {
        let (h, w) = (self.height as usize, self.width as usize);
        Array4::from_shape_vec((1, h, w, CHANNELS), self.data.clone())
            .unwrap_or_else(|_| Array4::zeros((1, h, w, CHANNELS)))
    }

    /// Batch-of-one NCHW tensor `[1, 3, H, W]`.
    pub fn to_nchw(&self) -> Array4<f32> {
        let (h, w) = (self.height as usize, self.width as usize);
        let mut tensor = Array4::<f32>::zeros((1, CHANNELS, h, w));
        for y in 0..h {
            for x in 0..w {
                let base = (y * w + x) * CHANNELS;
                for c in 0..CHANNELS {
                    tensor[[0, c, y, x]] = self.data[base + c];
                }
            }
        }
        tensor
    }

    /// Quantize back to 8-bit RGB (`round(v * 255)`).
    pub fn to_rgb8(&self) -> RgbImage {
        let w = self.width as usize;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let base = (y as usize * w + x as usize) * CHANNELS;
            let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            Rgb([q(self.data[base]), q(self.data[base + 1]), q(self.data[base + 2])])
        })
    }

    /// Write as an 8-bit image; the format follows the path's extension.
    pub fn save(&self, path: &Path) -> Result<(), PixelError> {
        self.to_rgb8().save(path)?;
        Ok(())
    }
}
