//! sketchface-core — Sketch reconstruction and face matching engine.
//!
//! A VAE sampler is run N times over a sketch and the draw with the highest
//! SSIM against the sketch's luminance is kept. The reconstruction is then
//! ranked against a pool of photos by face-embedding cosine similarity, with
//! Euclidean distance breaking ties. Both models run via ONNX Runtime.

pub mod alignment;
pub mod confidence;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod model;
pub mod pixels;
pub mod reconstructor;
pub mod report;
pub mod ssim;
pub mod types;
pub mod vae;

pub use confidence::ConfidenceScale;
pub use embedder::{EmbedderOptions, FaceEmbedder};
pub use matcher::{CandidatePool, Embedder, MatchError, Matcher, MatcherConfig, Ranking};
pub use model::{ModelError, TensorLayout};
pub use pixels::ImageTensor;
pub use reconstructor::{
    Reconstruction, ReconstructionError, Reconstructor, ReconstructorConfig, SampleFailurePolicy,
    Sampler,
};
pub use types::{CandidateRecord, Embedding, MatchResult};
pub use vae::{VaeOptions, VaeSampler};
