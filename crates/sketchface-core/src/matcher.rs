//! Candidate-pool ranking by face embedding.
//!
//! The reconstruction is embedded once, every pool image is embedded
//! independently, and survivors are ranked by cosine similarity with
//! Euclidean distance as the tie-breaker. Individual candidates that cannot
//! be embedded are skipped, never scored.

use crate::confidence::ConfidenceScale;
use crate::types::{CandidateRecord, Embedding, MatchResult};
use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// File extensions accepted as pool members (compared case-insensitively).
pub const POOL_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum EmbedError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("no face detected in the reconstruction; no match possible")]
    NoEmbedding,
    #[error("candidate pool {} unavailable: {source}", path.display())]
    PoolUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no similar image found ({skipped} candidates skipped)")]
    NoCandidates { skipped: usize },
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
}

/// Capability interface over a face-embedding model.
///
/// `Ok(None)` means no face was found; `Err` means the model itself failed.
pub trait Embedder: Send + Sync {
    fn embed(&self, image: &RgbImage) -> Result<Option<Embedding>, EmbedError>;
}

impl<T: Embedder + ?Sized> Embedder for Box<T> {
    fn embed(&self, image: &RgbImage) -> Result<Option<Embedding>, EmbedError> {
        (**self).embed(image)
    }
}

/// Why a pool member was left out of the ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    Unreadable(String),
    EmbeddingFailed(String),
    NoFace,
    /// Embedding from a different model or with a different dimension.
    IncompatibleEmbedding,
    /// Cosine similarity or distance came out NaN or infinite.
    NonFiniteScore,
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCandidate {
    pub filename: String,
    pub reason: SkipReason,
}

/// A flat directory of candidate photos, ordered by filename.
#[derive(Debug, Clone)]
pub struct CandidatePool {
    entries: Vec<PathBuf>,
}

impl CandidatePool {
    /// List image files directly inside `dir` (no recursion).
    pub fn scan(dir: &Path) -> Result<Self, MatchError> {
        let unavailable = |source| MatchError::PoolUnavailable {
            path: dir.to_path_buf(),
            source,
        };

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(unavailable)? {
            let entry = entry.map_err(unavailable)?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| POOL_EXTENSIONS.iter().any(|ok| e.eq_ignore_ascii_case(ok)))
                .unwrap_or(false);
            if is_image {
                entries.push(path);
            } else {
                tracing::debug!(path = %path.display(), "pool: ignoring non-image file");
            }
        }
        entries.sort();

        tracing::info!(dir = %dir.display(), candidates = entries.len(), "pool scanned");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ranked survivors (best first) and the candidates that were skipped.
#[derive(Debug, Clone, Serialize)]
pub struct Ranking {
    records: Vec<CandidateRecord>,
    skipped: Vec<SkippedCandidate>,
}

impl Ranking {
    /// Sort scored candidates into ranking order. Fails if nothing survived.
    pub fn from_scored(
        mut records: Vec<CandidateRecord>,
        skipped: Vec<SkippedCandidate>,
    ) -> Result<Self, MatchError> {
        if records.is_empty() {
            return Err(MatchError::NoCandidates { skipped: skipped.len() });
        }
        records.sort_by(CandidateRecord::rank_cmp);
        Ok(Self { records, skipped })
    }

    pub fn best(&self) -> &CandidateRecord {
        &self.records[0]
    }

    pub fn records(&self) -> &[CandidateRecord] {
        &self.records
    }

    pub fn skipped(&self) -> &[SkippedCandidate] {
        &self.skipped
    }

    /// Top match with its unclamped confidence.
    pub fn to_match(&self, scale: &ConfidenceScale) -> MatchResult {
        let best = self.best().clone();
        let confidence = scale.confidence(best.cosine_similarity, best.euclidean_distance);
        MatchResult { best, confidence }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MatcherConfig {
    /// Wall-time bound for the pool scan. Candidates not started in time are skipped.
    pub scan_deadline: Option<Duration>,
}

enum ScanOutcome {
    Scored(CandidateRecord),
    Skipped(SkippedCandidate),
}

pub struct Matcher<E> {
    embedder: E,
    config: MatcherConfig,
}

impl<E: Embedder> Matcher<E> {
    pub fn new(embedder: E, config: MatcherConfig) -> Self {
        Self { embedder, config }
    }

    /// Rank the pool against a reconstruction stored on disk.
    pub fn rank_file(
        &self,
        reconstruction: &Path,
        pool: &CandidatePool,
    ) -> Result<Ranking, MatchError> {
        let image = image::open(reconstruction)?.to_rgb8();
        self.find_best_match(&image, pool)
    }

    /// Embed the reconstruction, score every embeddable candidate, and sort.
    ///
    /// A reconstruction without a usable embedding (no face, or the model
    /// failed on it) is [`MatchError::NoEmbedding`].
    pub fn find_best_match(
        &self,
        reconstruction: &RgbImage,
        pool: &CandidatePool,
    ) -> Result<Ranking, MatchError> {
        let query = match self.embedder.embed(reconstruction) {
            Ok(Some(query)) => query,
            Ok(None) => return Err(MatchError::NoEmbedding),
            Err(e) => {
                tracing::warn!(error = %e, "matcher: embedding the reconstruction failed");
                return Err(MatchError::NoEmbedding);
            }
        };

        tracing::debug!(
            dim = query.values.len(),
            model = ?query.model_version,
            "matcher: reconstruction embedded"
        );

        let started = Instant::now();
        let outcomes: Vec<ScanOutcome> = pool
            .entries
            .par_iter()
            .map(|path| self.score_candidate(&query, path, started))
            .collect();

        let mut records = Vec::with_capacity(outcomes.len());
        let mut skipped = Vec::new();
        for outcome in outcomes {
            match outcome {
                ScanOutcome::Scored(record) => records.push(record),
                ScanOutcome::Skipped(s) => {
                    tracing::warn!(
                        filename = %s.filename,
                        reason = ?s.reason,
                        "matcher: candidate skipped"
                    );
                    skipped.push(s);
                }
            }
        }

        let ranking = Ranking::from_scored(records, skipped)?;
        let best = ranking.best();
        tracing::info!(
            filename = %best.filename,
            cosine = best.cosine_similarity,
            euclidean = best.euclidean_distance,
            ranked = ranking.records.len(),
            skipped = ranking.skipped.len(),
            "matcher: best candidate"
        );
        Ok(ranking)
    }

    fn score_candidate(&self, query: &Embedding, path: &Path, started: Instant) -> ScanOutcome {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let skip = |reason| {
            ScanOutcome::Skipped(SkippedCandidate {
                filename: filename.clone(),
                reason,
            })
        };

        if let Some(limit) = self.config.scan_deadline {
            if started.elapsed() >= limit {
                return skip(SkipReason::DeadlineExceeded);
            }
        }

        let image = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => return skip(SkipReason::Unreadable(e.to_string())),
        };

        match self.embedder.embed(&image) {
            Ok(Some(embedding)) if query.is_comparable(&embedding) => {
                let record = CandidateRecord::score(filename.clone(), query, &embedding);
                if record.cosine_similarity.is_finite() && record.euclidean_distance.is_finite() {
                    ScanOutcome::Scored(record)
                } else {
                    skip(SkipReason::NonFiniteScore)
                }
            }
            Ok(Some(_)) => skip(SkipReason::IncompatibleEmbedding),
            Ok(None) => skip(SkipReason::NoFace),
            Err(e) => skip(SkipReason::EmbeddingFailed(e.to_string())),
        }
    }
}
