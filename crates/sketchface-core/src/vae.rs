//! Variational autoencoder sampler via ONNX Runtime.
//!
//! Two export shapes are supported. A single-input graph carries its own
//! reparameterization noise op, so each run already draws fresh noise. A
//! graph with a second input takes the noise `ε ~ N(0, 1)` explicitly; it is
//! drawn from the per-draw RNG, which makes seeded runs reproducible.

use crate::model::{self, ModelError, TensorLayout};
use crate::pixels::ImageTensor;
use crate::reconstructor::{SampleError, Sampler};
use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;
use rand::rngs::StdRng;
use rand::Rng;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct VaeOptions {
    pub layout: TensorLayout,
    /// Latent size for graphs that take explicit noise. Required if the graph has a second input.
    pub latent_dim: Option<usize>,
}

pub struct VaeSampler {
    // ort sessions need exclusive access per run; the mutex serializes parallel draws.
    session: Mutex<Session>,
    layout: TensorLayout,
    noise_dim: Option<usize>,
}

impl VaeSampler {
    pub fn load(model_path: &Path, options: VaeOptions) -> Result<Self, ModelError> {
        let session = model::load_session(model_path, "VAE")?;

        let noise_dim = match (session.inputs().len(), options.latent_dim) {
            (1, _) => None,
            (2, Some(dim)) if dim > 0 => Some(dim),
            (2, _) => {
                return Err(ModelError::Signature {
                    model: model_path.display().to_string(),
                    detail: "graph takes an explicit noise input; configure the latent dimension"
                        .into(),
                })
            }
            (n, _) => {
                return Err(ModelError::Signature {
                    model: model_path.display().to_string(),
                    detail: format!("expected 1 or 2 inputs, got {n}"),
                })
            }
        };

        tracing::info!(layout = ?options.layout, noise_dim = ?noise_dim, "VAE sampler ready");

        Ok(Self {
            session: Mutex::new(session),
            layout: options.layout,
            noise_dim,
        })
    }
}

impl Sampler for VaeSampler {
    fn sample(&self, input: &ImageTensor, rng: &mut StdRng) -> Result<ImageTensor, SampleError> {
        let tensor = match self.layout {
            TensorLayout::Nhwc => input.to_nhwc(),
            TensorLayout::Nchw => input.to_nchw(),
        };
        let noise = self.noise_dim.map(|dim| standard_normal_batch(rng, dim));

        let raw: Vec<f32> = {
            let mut session = self
                .session
                .lock()
                .map_err(|_| SampleError::InferenceFailed("VAE session lock poisoned".into()))?;

            let outputs = match &noise {
                Some(eps) => session.run(ort::inputs![
                    TensorRef::from_array_view(tensor.view())?,
                    TensorRef::from_array_view(eps.view())?
                ])?,
                None => session.run(ort::inputs![TensorRef::from_array_view(tensor.view())?])?,
            };

            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| SampleError::InferenceFailed(format!("decoder output: {e}")))?;
            data.to_vec()
        };

        let (w, h) = (input.width(), input.height());
        let decoded = match self.layout {
            TensorLayout::Nhwc => ImageTensor::from_hwc(w, h, raw)?,
            TensorLayout::Nchw => ImageTensor::from_chw(w, h, &raw)?,
        };
        Ok(decoded.clipped())
    }
}

/// `[1, dim]` batch of standard normal noise (Box–Muller).
fn standard_normal_batch(rng: &mut StdRng, dim: usize) -> Array2<f32> {
    Array2::from_shape_fn((1, dim), |_| {
        // 1 - U maps [0, 1) to (0, 1], keeping ln() finite.
        let u1: f32 = 1.0 - rng.gen::<f32>();
        let u2: f32 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    })
}
