//! Request wiring: sketch in, reconstruction and ranked match out.

use crate::archive::UploadArchive;
use crate::config::Config;
use crate::records::{Annotation, JsonRecordStore, RecordError, RecordLookup};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sketchface_core::matcher::SkippedCandidate;
use sketchface_core::{
    report, CandidatePool, CandidateRecord, ConfidenceScale, Embedder, FaceEmbedder, MatchError,
    Matcher, ModelError, ReconstructionError, Reconstructor, Sampler, VaeSampler,
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("records lookup failed: {0}")]
    Records(#[from] RecordError),
}

/// Load the VAE once. Missing or malformed models are fatal.
pub fn load_reconstructor(config: &Config) -> Result<Reconstructor<VaeSampler>, ModelError> {
    let sampler = VaeSampler::load(&config.sampler_model_path(), config.vae_options())?;
    Ok(Reconstructor::new(sampler, config.reconstructor_config()))
}

/// Load the face detector and embedding model once.
pub fn load_matcher(config: &Config) -> Result<Matcher<FaceEmbedder>, ModelError> {
    let embedder = FaceEmbedder::load(
        &config.detector_model_path(),
        &config.embedder_model_path(),
        config.embedder_options(),
    )?;
    Ok(Matcher::new(embedder, config.matcher_config()))
}

/// Common fields of every JSON report.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: T,
}

impl<T> Envelope<T> {
    pub fn new(request_id: Uuid, body: T) -> Self {
        Self {
            request_id,
            timestamp: Utc::now(),
            body,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconstructionSummary {
    pub sketch: PathBuf,
    pub output: PathBuf,
    pub draw: usize,
    pub ssim: f64,
    pub samples: usize,
    pub failed_or_abandoned: usize,
    pub elapsed_ms: u64,
}

/// Result of ranking a reconstruction against the pool.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Matched {
        best: CandidateRecord,
        confidence: f32,
        annotations: Vec<Annotation>,
        ranking: Vec<CandidateRecord>,
        skipped: Vec<SkippedCandidate>,
    },
    /// No face in the reconstruction.
    NoEmbedding,
    /// No pool member could be scored.
    NoCandidates { skipped: usize },
}

impl Outcome {
    /// Text block in the historical report format.
    pub fn to_legacy(&self) -> String {
        match self {
            Outcome::Matched {
                best,
                confidence,
                annotations,
                ..
            } => {
                let mut text = report::format_legacy(best);
                text.push_str(&format!("Confidence: {confidence:.2}%\n"));
                for a in annotations {
                    text.push_str(&format!(
                        "Record: {} | {} | {confidence:.2}%\n",
                        a.name, a.crime
                    ));
                }
                text
            }
            Outcome::NoEmbedding => {
                "No face detected in the reconstruction; no match possible.\n".to_string()
            }
            Outcome::NoCandidates { .. } => "No similar images found.\n".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IdentifyReport {
    pub reconstruction: ReconstructionSummary,
    /// Archive folder, when archiving is enabled and succeeded.
    pub archived: Option<PathBuf>,
    pub outcome: Outcome,
}

impl IdentifyReport {
    pub fn to_legacy(&self) -> String {
        format!(
            "Reconstruction: {} (sample {}, SSIM {:.4})\n{}",
            self.reconstruction.output.display(),
            self.reconstruction.draw,
            self.reconstruction.ssim,
            self.outcome.to_legacy()
        )
    }
}

/// Reconstruct `sketch` and write the winner to `output`.
pub fn reconstruct<S: Sampler>(
    reconstructor: &Reconstructor<S>,
    sketch: &Path,
    output: &Path,
) -> Result<ReconstructionSummary, PipelineError> {
    let result = reconstructor.reconstruct_file(sketch, output)?;
    Ok(ReconstructionSummary {
        sketch: sketch.to_path_buf(),
        output: output.to_path_buf(),
        draw: result.draw,
        ssim: result.score,
        samples: result.scores.len(),
        failed_or_abandoned: result.scores.iter().filter(|s| s.is_none()).count(),
        elapsed_ms: result.elapsed.as_millis() as u64,
    })
}

/// Rank a reconstruction on disk against `pool_dir` and annotate the winner.
///
/// A faceless reconstruction and an unscorable pool are outcomes, not errors.
pub fn match_reconstruction<E: Embedder>(
    matcher: &Matcher<E>,
    scale: &ConfidenceScale,
    records: &dyn RecordLookup,
    reconstruction: &Path,
    pool_dir: &Path,
) -> Result<Outcome, PipelineError> {
    let pool = CandidatePool::scan(pool_dir)?;
    let ranking = match matcher.rank_file(reconstruction, &pool) {
        Ok(ranking) => ranking,
        Err(MatchError::NoEmbedding) => {
            tracing::warn!("no face in reconstruction");
            return Ok(Outcome::NoEmbedding);
        }
        Err(MatchError::NoCandidates { skipped }) => {
            tracing::warn!(skipped, "no candidate could be scored");
            return Ok(Outcome::NoCandidates { skipped });
        }
        Err(e) => return Err(e.into()),
    };

    let result = ranking.to_match(scale);
    let annotations = records.lookup(&result.best.filename, result.confidence)?;
    tracing::info!(
        filename = %result.best.filename,
        confidence = result.confidence,
        annotations = annotations.len(),
        "match complete"
    );

    Ok(Outcome::Matched {
        best: result.best,
        confidence: result.confidence,
        annotations,
        ranking: ranking.records().to_vec(),
        skipped: ranking.skipped().to_vec(),
    })
}

/// Everything `identify` needs, loaded once.
pub struct Pipeline<S, E> {
    reconstructor: Reconstructor<S>,
    matcher: Matcher<E>,
    scale: ConfidenceScale,
    records: Box<dyn RecordLookup>,
    archive: Option<UploadArchive>,
    output_path: PathBuf,
    pool_dir: PathBuf,
}

impl Pipeline<VaeSampler, FaceEmbedder> {
    pub fn load(config: &Config) -> Result<Self, ModelError> {
        Ok(Self::new(load_reconstructor(config)?, load_matcher(config)?, config))
    }
}

impl<S: Sampler, E: Embedder> Pipeline<S, E> {
    pub fn new(reconstructor: Reconstructor<S>, matcher: Matcher<E>, config: &Config) -> Self {
        Self {
            reconstructor,
            matcher,
            scale: config.confidence_scale(),
            records: Box::new(JsonRecordStore::new(&config.records_path)),
            archive: config.archive.then(|| UploadArchive::new(&config.logs_dir)),
            output_path: config.output_path.clone(),
            pool_dir: config.pool_dir.clone(),
        }
    }

    /// Sketch → reconstruction → archive → ranking → confidence → annotations.
    pub fn identify(&self, sketch: &Path) -> Result<IdentifyReport, PipelineError> {
        let reconstruction = reconstruct(&self.reconstructor, sketch, &self.output_path)?;

        // Archiving is bookkeeping; a failure there does not fail the request.
        let archived = self
            .archive
            .as_ref()
            .and_then(|archive| match archive.store(sketch, &self.output_path) {
                Ok(folder) => Some(folder),
                Err(e) => {
                    tracing::warn!(error = %e, "archiving upload failed");
                    None
                }
            });

        let outcome = match_reconstruction(
            &self.matcher,
            &self.scale,
            self.records.as_ref(),
            &self.output_path,
            &self.pool_dir,
        )?;

        Ok(IdentifyReport {
            reconstruction,
            archived,
            outcome,
        })
    }
}
