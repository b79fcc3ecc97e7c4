//! Combined match confidence from cosine similarity and Euclidean distance.

use serde::{Deserialize, Serialize};

/// Reference maximum Euclidean distance for normalization.
///
/// Calibrated for FaceNet-style embeddings; recalibrate when swapping models.
pub const DEFAULT_MAX_DISTANCE: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScale {
    pub max_distance: f32,
}

impl Default for ConfidenceScale {
    fn default() -> Self {
        Self {
            max_distance: DEFAULT_MAX_DISTANCE,
        }
    }
}

impl ConfidenceScale {
    pub fn new(max_distance: f32) -> Self {
        Self { max_distance }
    }

    /// Distance as a percentage of `max_distance`. Exceeds 100 past the reference.
    pub fn normalized_distance(&self, euclidean: f32) -> f32 {
        euclidean / self.max_distance * 100.0
    }

    /// `cosine * 100 - normalized distance`.
    ///
    /// Deliberately unclamped: downstream displays the raw score, which can
    /// be negative or exceed 100.
    pub fn confidence(&self, cosine: f32, euclidean: f32) -> f32 {
        cosine * 100.0 - self.normalized_distance(euclidean)
    }
}
