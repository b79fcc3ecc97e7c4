//! Face embedding extraction via ONNX Runtime.
//!
//! Detects the most confident face, aligns it to the embedding model's
//! input size, and runs the embedding model. Defaults match a FaceNet-512
//! export: 160×160 NHWC input, `(x - 127.5) / 128` normalization, raw
//! (non-normalized) output. The default confidence scale is calibrated on
//! raw FaceNet distances, so L2 normalization is opt-in.

use crate::alignment;
use crate::detector::{BoundingBox, FaceDetector};
use crate::matcher::{EmbedError, Embedder};
use crate::model::{self, ModelError, TensorLayout};
use crate::types::Embedding;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

pub const DEFAULT_EMBEDDING_INPUT_SIZE: u32 = 160;
pub const DEFAULT_EMBEDDING_MEAN: f32 = 127.5;
pub const DEFAULT_EMBEDDING_STD: f32 = 128.0;
pub const DEFAULT_EMBEDDING_MODEL_VERSION: &str = "facenet512";

#[derive(Debug, Clone)]
pub struct EmbedderOptions {
    pub input_size: u32,
    pub mean: f32,
    pub std: f32,
    pub layout: TensorLayout,
    /// Expected embedding length; `None` accepts whatever the model emits.
    pub dim: Option<usize>,
    pub l2_normalize: bool,
    pub model_version: String,
}

impl Default for EmbedderOptions {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_EMBEDDING_INPUT_SIZE,
            mean: DEFAULT_EMBEDDING_MEAN,
            std: DEFAULT_EMBEDDING_STD,
            layout: TensorLayout::Nhwc,
            dim: Some(512),
            l2_normalize: false,
            model_version: DEFAULT_EMBEDDING_MODEL_VERSION.to_string(),
        }
    }
}

pub struct FaceEmbedder {
    detector: FaceDetector,
    session: Mutex<Session>,
    options: EmbedderOptions,
}

impl FaceEmbedder {
    /// Load both the detection and the embedding model.
    pub fn load(
        detector_path: &Path,
        model_path: &Path,
        options: EmbedderOptions,
    ) -> Result<Self, ModelError> {
        let detector = FaceDetector::load(detector_path)?;
        let session = model::load_session(model_path, "embedding")?;
        Ok(Self {
            detector,
            session: Mutex::new(session),
            options,
        })
    }
}

/// Face crop at the model's input size: landmark-aligned when landmarks are
/// available, otherwise the bounding box resized.
fn face_crop(image: &RgbImage, face: &BoundingBox, size: u32) -> RgbImage {
    match &face.landmarks {
        Some(landmarks) => alignment::align_face(image, landmarks, size),
        None => {
            let x = (face.x.max(0.0) as u32).min(image.width().saturating_sub(1));
            let y = (face.y.max(0.0) as u32).min(image.height().saturating_sub(1));
            let w = (face.width.max(1.0) as u32).min(image.width() - x);
            let h = (face.height.max(1.0) as u32).min(image.height() - y);
            let crop = image::imageops::crop_imm(image, x, y, w, h).to_image();
            image::imageops::resize(&crop, size, size, FilterType::Triangle)
        }
    }
}

fn preprocess(face: &RgbImage, options: &EmbedderOptions) -> Array4<f32> {
    let size = face.width() as usize;
    let shape = match options.layout {
        TensorLayout::Nhwc => (1, size, size, 3),
        TensorLayout::Nchw => (1, 3, size, size),
    };
    let mut tensor = Array4::<f32>::zeros(shape);
    for (x, y, pixel) in face.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let v = (pixel[c] as f32 - options.mean) / options.std;
            match options.layout {
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = v,
                TensorLayout::Nchw => tensor[[0, c, y, x]] = v,
            }
        }
    }
    tensor
}

/// Validate raw model output and tag it with the model version.
fn finish(mut values: Vec<f32>, options: &EmbedderOptions) -> Result<Embedding, EmbedError> {
    if let Some(dim) = options.dim {
        if values.len() != dim {
            return Err(EmbedError::InferenceFailed(format!(
                "expected {dim}-dim embedding, got {}",
                values.len()
            )));
        }
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(EmbedError::InferenceFailed("embedding contains non-finite values".into()));
    }
    if options.l2_normalize {
        let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|x| *x /= norm);
        }
    }
    Ok(Embedding::new(values, Some(options.model_version.clone())))
}

impl Embedder for FaceEmbedder {
    fn embed(&self, image: &RgbImage) -> Result<Option<Embedding>, EmbedError> {
        let faces = self
            .detector
            .detect(image)
            .map_err(|e| EmbedError::InferenceFailed(format!("face detection: {e}")))?;

        let Some(face) = faces.first() else {
            tracing::debug!(
                width = image.width(),
                height = image.height(),
                "embedder: no face detected"
            );
            return Ok(None);
        };
        tracing::debug!(
            confidence = face.confidence,
            faces = faces.len(),
            "embedder: face detected"
        );

        let crop = face_crop(image, face, self.options.input_size);
        let input = preprocess(&crop, &self.options);

        let raw: Vec<f32> = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| {
                    EmbedError::InferenceFailed("embedding session lock poisoned".into())
                })?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| EmbedError::InferenceFailed(format!("embedding extraction: {e}")))?;
            data.to_vec()
        };

        finish(raw, &self.options).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_requires_detector() {
        let result = FaceEmbedder::load(
            Path::new("/nonexistent/det_10g.onnx"),
            Path::new("/nonexistent/facenet512.onnx"),
            EmbedderOptions::default(),
        );
        assert!(matches!(result, Err(ModelError::NotFound(p)) if p.contains("det_10g")));
    }

    #[test]
    fn test_default_options() {
        let o = EmbedderOptions::default();
        assert_eq!(o.input_size, 160);
        assert_eq!(o.dim, Some(512));
        assert!(!o.l2_normalize);
        // Pixel 127.5 normalizes to zero.
        assert_eq!((127.5 - o.mean) / o.std, 0.0);
    }

    #[test]
    fn test_preprocess_layouts() {
        let mut face = RgbImage::new(4, 4);
        face.put_pixel(1, 2, image::Rgb([255, 127, 0]));

        let nhwc = preprocess(&face, &EmbedderOptions::default());
        assert_eq!(nhwc.shape(), &[1, 4, 4, 3]);
        assert!((nhwc[[0, 2, 1, 0]] - (255.0 - 127.5) / 128.0).abs() < 1e-6);
        assert!((nhwc[[0, 2, 1, 2]] + 127.5 / 128.0).abs() < 1e-6);

        let options = EmbedderOptions {
            layout: TensorLayout::Nchw,
            ..Default::default()
        };
        let nchw = preprocess(&face, &options);
        assert_eq!(nchw.shape(), &[1, 3, 4, 4]);
        assert_eq!(nchw[[0, 0, 2, 1]], nhwc[[0, 2, 1, 0]]);
    }

    #[test]
    fn test_finish_checks_dimension() {
        let options = EmbedderOptions {
            dim: Some(4),
            ..Default::default()
        };
        assert!(finish(vec![1.0; 3], &options).is_err());
        assert!(finish(vec![1.0, f32::NAN, 0.0, 0.0], &options).is_err());

        let e = finish(vec![3.0, 4.0, 0.0, 0.0], &options).unwrap();
        assert_eq!(e.values, vec![3.0, 4.0, 0.0, 0.0]);
        assert_eq!(e.model_version.as_deref(), Some("facenet512"));
    }

    #[test]
    fn test_finish_l2_normalize() {
        let options = EmbedderOptions {
            dim: None,
            l2_normalize: true,
            ..Default::default()
        };
        let e = finish(vec![3.0, 4.0], &options).unwrap();
        assert!((e.values[0] - 0.6).abs() < 1e-6);
        assert!((e.values[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_crop_without_landmarks() {
        let image = RgbImage::from_pixel(100, 80, image::Rgb([10, 20, 30]));
        let face = BoundingBox {
            x: 90.0,
            y: -5.0,
            width: 40.0,
            height: 40.0,
            confidence: 0.9,
            landmarks: None,
        };
        let crop = face_crop(&image, &face, 160);
        assert_eq!(crop.dimensions(), (160, 160));
        assert_eq!(crop.get_pixel(0, 0), &image::Rgb([10, 20, 30]));
    }
}
