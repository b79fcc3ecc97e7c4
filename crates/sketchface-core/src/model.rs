//! Shared ONNX Runtime session loading.

use ort::session::Session;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

const INTRA_THREADS: usize = 2;

/// A model could not be brought up. Fatal at startup, never per request.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error(
        "model file not found: {0}; export the model to ONNX and place it in the model directory"
    )]
    NotFound(String),
    #[error("unexpected model signature for {model}: {detail}")]
    Signature { model: String, detail: String },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Memory layout of a model's image input/output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[1, H, W, 3]`, the Keras export default.
    #[default]
    Nhwc,
    /// `[1, 3, H, W]`.
    Nchw,
}

impl FromStr for TensorLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nhwc" => Ok(Self::Nhwc),
            "nchw" => Ok(Self::Nchw),
            other => Err(format!("unknown tensor layout {other:?} (expected nhwc or nchw)")),
        }
    }
}

/// Open an ONNX session, logging its I/O signature.
pub(crate) fn load_session(model_path: &Path, kind: &str) -> Result<Session, ModelError> {
    if !model_path.exists() {
        return Err(ModelError::NotFound(model_path.display().to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(INTRA_THREADS)
        .map_err(ort::Error::from)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = %model_path.display(),
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded {kind} model"
    );

    Ok(session)
}
