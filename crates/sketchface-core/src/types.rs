use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Face embedding vector produced by one embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "facenet512").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: Option<String>) -> Self {
        Self { values, model_version }
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector on
    /// either side yields 0.0. Sums accumulate in `f64` so large components
    /// do not overflow.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (a as f64, b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { (dot / denom) as f32 } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings. Lower = more similar.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| (a as f64 - b as f64).powi(2))
            .sum::<f64>()
            .sqrt() as f32
    }

    /// Whether two embeddings live in the same feature space.
    ///
    /// Both dimension and model version must agree; an untagged embedding
    /// is only comparable with another untagged one.
    pub fn is_comparable(&self, other: &Embedding) -> bool {
        self.values.len() == other.values.len() && self.model_version == other.model_version
    }
}

/// One scored member of a candidate pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    /// Filename within the pool directory, echoed verbatim in output.
    pub filename: String,
    /// Cosine similarity against the reconstruction [-1, 1]. Higher = better.
    pub cosine_similarity: f32,
    /// Euclidean distance against the reconstruction (>= 0). Lower = better.
    pub euclidean_distance: f32,
}

impl CandidateRecord {
    pub fn score(filename: impl Into<String>, query: &Embedding, candidate: &Embedding) -> Self {
        Self {
            filename: filename.into(),
            cosine_similarity: query.similarity(candidate),
            euclidean_distance: query.euclidean_distance(candidate),
        }
    }

    /// Ranking order: cosine similarity descending, then Euclidean distance
    /// ascending, then filename so equal scores still sort reproducibly.
    pub fn rank_cmp(&self, other: &CandidateRecord) -> Ordering {
        other
            .cosine_similarity
            .total_cmp(&self.cosine_similarity)
            .then_with(|| self.euclidean_distance.total_cmp(&other.euclidean_distance))
            .then_with(|| self.filename.cmp(&other.filename))
    }
}

/// Top match of a ranking together with its derived confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub best: CandidateRecord,
    /// `cosine * 100 - normalized distance`. Unclamped: may be negative or exceed 100.
    pub confidence: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), None)
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a.clone()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        assert!((emb(&[1.0, 0.0]).similarity(&emb(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_large_components_stay_finite() {
        let a = emb(&[1e20, 1e20]);
        let cos = a.similarity(&a.clone());
        assert!((cos - 1.0).abs() < 1e-6, "cos = {cos}");
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);

        let far = emb(&[-1e20, 1e20]).euclidean_distance(&emb(&[1e20, 1e20]));
        assert!(far.is_finite() && (far - 2e20).abs() / 2e20 < 1e-6, "d = {far}");
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_cosine_ignores_magnitude() {
        let a = emb(&[1.0, 2.0, 3.0]);
        let b = emb(&[2.0, 4.0, 6.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
        assert!(a.euclidean_distance(&b) > 3.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_comparable_requires_same_model() {
        let a = Embedding::new(vec![1.0, 0.0], Some("facenet512".into()));
        let b = Embedding::new(vec![1.0, 0.0], Some("arcface".into()));
        let c = Embedding::new(vec![1.0, 0.0, 0.0], Some("facenet512".into()));
        assert!(a.is_comparable(&a.clone()));
        assert!(!a.is_comparable(&b));
        assert!(!a.is_comparable(&c));
    }

    #[test]
    fn test_rank_cmp_similarity_dominates() {
        let better = CandidateRecord {
            filename: "b.jpg".into(),
            cosine_similarity: 0.9,
            euclidean_distance: 50.0,
        };
        let worse = CandidateRecord {
            filename: "a.jpg".into(),
            cosine_similarity: 0.8,
            euclidean_distance: 0.1,
        };
        assert_eq!(better.rank_cmp(&worse), Ordering::Less);
    }

    #[test]
    fn test_rank_cmp_distance_breaks_ties() {
        let near = CandidateRecord {
            filename: "z.jpg".into(),
            cosine_similarity: 0.7,
            euclidean_distance: 1.0,
        };
        let far = CandidateRecord {
            filename: "a.jpg".into(),
            cosine_similarity: 0.7,
            euclidean_distance: 2.0,
        };
        assert_eq!(near.rank_cmp(&far), Ordering::Less);
        assert_eq!(far.rank_cmp(&near), Ordering::Greater);
    }
}
