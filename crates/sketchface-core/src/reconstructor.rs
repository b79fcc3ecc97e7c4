//! Best-of-N sketch reconstruction.
//!
//! Draws N independent samples from a stochastic generative model, scores
//! each against the input sketch with SSIM on luminance, and keeps the
//! highest-scoring sample.

use crate::pixels::{ImageTensor, PixelError};
use crate::ssim::{self, SsimError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of draws when not configured otherwise.
pub const DEFAULT_SAMPLES: usize = 50;
/// Square input resolution of the reconstruction model.
pub const DEFAULT_INPUT_SIZE: u32 = 256;

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error(transparent)]
    Pixels(#[from] PixelError),
}

#[derive(Error, Debug)]
pub enum ReconstructionError {
    #[error("sample count must be at least 1")]
    NoSamples,
    #[error("sample {draw} failed: {source}")]
    Sampler {
        draw: usize,
        #[source]
        source: SampleError,
    },
    #[error("sample {draw} is {got_width}x{got_height}, input is {width}x{height}")]
    ShapeMismatch {
        draw: usize,
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },
    #[error("scoring failed: {0}")]
    Ssim(#[from] SsimError),
    #[error("all {samples} samples failed; first failure: {first}")]
    AllSamplesFailed {
        samples: usize,
        first: Box<ReconstructionError>,
    },
    #[error("deadline of {0:?} elapsed before any sample finished")]
    DeadlineExceeded(Duration),
    #[error(transparent)]
    Pixels(#[from] PixelError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability interface over a stochastic generative model.
///
/// Every call must draw its noise from `rng` (or from fresh internal
/// randomness) and must not depend on earlier calls.
pub trait Sampler: Send + Sync {
    fn sample(&self, input: &ImageTensor, rng: &mut StdRng) -> Result<ImageTensor, SampleError>;
}

impl<T: Sampler + ?Sized> Sampler for Box<T> {
    fn sample(
        &self,
        input: &ImageTensor,
        rng: &mut StdRng,
    ) -> Result<ImageTensor, SampleError> {
        (**self).sample(input, rng)
    }
}

/// What to do when a single draw fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFailurePolicy {
    /// Abort the whole request on the first failed draw.
    Abort,
    /// Log the failed draw and select among the rest.
    #[default]
    Skip,
}

impl FromStr for SampleFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            other => Err(format!(
                "unknown sample failure policy {other:?} (expected abort or skip)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconstructorConfig {
    pub samples: usize,
    /// Base seed; draw `i` uses `seed + i`. `None` draws from OS entropy.
    pub seed: Option<u64>,
    pub failure_policy: SampleFailurePolicy,
    /// Wall-time bound for the whole batch. Draws not started in time are abandoned.
    pub deadline: Option<Duration>,
    pub input_size: u32,
}

impl Default for ReconstructorConfig {
    fn default() -> Self {
        Self {
            samples: DEFAULT_SAMPLES,
            seed: None,
            failure_policy: SampleFailurePolicy::default(),
            deadline: None,
            input_size: DEFAULT_INPUT_SIZE,
        }
    }
}

/// One scored draw. Lives only until selection.
#[derive(Debug, Clone)]
pub struct ReconstructionCandidate {
    pub draw: usize,
    pub image: ImageTensor,
    pub score: f64,
}

/// The winning draw plus the per-draw scores (`None` for failed or abandoned draws).
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub image: ImageTensor,
    pub score: f64,
    pub draw: usize,
    pub scores: Vec<Option<f64>>,
    pub elapsed: Duration,
}

enum DrawOutcome {
    Scored(ReconstructionCandidate),
    Failed(ReconstructionError),
    Abandoned,
}

pub struct Reconstructor<S> {
    sampler: S,
    config: ReconstructorConfig,
}

impl<S: Sampler> Reconstructor<S> {
    pub fn new(sampler: S, config: ReconstructorConfig) -> Self {
        Self { sampler, config }
    }

    /// Load a sketch, reconstruct it, and write the winner to `output` (overwritten).
    pub fn reconstruct_file(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<Reconstruction, ReconstructionError> {
        let sketch = ImageTensor::load(input, self.config.input_size)?;
        let result = self.reconstruct(&sketch)?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        result.image.save(output)?;
        tracing::info!(
            output = %output.display(),
            score = result.score,
            draw = result.draw,
            "reconstruction written"
        );
        Ok(result)
    }

    /// Draw N samples and return the one with the strictly highest SSIM.
    ///
    /// Ties keep the lowest draw index.
    pub fn reconstruct(&self, input: &ImageTensor) -> Result<Reconstruction, ReconstructionError> {
        let n = self.config.samples;
        if n == 0 {
            return Err(ReconstructionError::NoSamples);
        }

        let started = Instant::now();
        let original_gray = input.grayscale();
        let aborted = AtomicBool::new(false);

        tracing::info!(
            samples = n,
            seeded = self.config.seed.is_some(),
            policy = ?self.config.failure_policy,
            "reconstruction: sampling"
        );

        // Indexed collect keeps draw order regardless of completion order.
        let outcomes: Vec<DrawOutcome> = (0..n)
            .into_par_iter()
            .map(|draw| {
                if aborted.load(Ordering::Relaxed) {
                    return DrawOutcome::Abandoned;
                }
                if let Some(limit) = self.config.deadline {
                    if started.elapsed() >= limit {
                        return DrawOutcome::Abandoned;
                    }
                }
                match self.draw(input, &original_gray, draw) {
                    Ok(candidate) => DrawOutcome::Scored(candidate),
                    Err(e) => {
                        if self.config.failure_policy == SampleFailurePolicy::Abort {
                            aborted.store(true, Ordering::Relaxed);
                        }
                        DrawOutcome::Failed(e)
                    }
                }
            })
            .collect();

        let mut scores = Vec::with_capacity(n);
        let mut best: Option<ReconstructionCandidate> = None;
        let mut first_failure: Option<ReconstructionError> = None;
        let mut failed = 0usize;
        let mut abandoned = 0usize;

        for outcome in outcomes {
            match outcome {
                DrawOutcome::Scored(candidate) => {
                    scores.push(Some(candidate.score));
                    let better = match &best {
                        None => true,
                        Some(b) => candidate.score > b.score,
                    };
                    if better {
                        best = Some(candidate);
                    }
                }
                DrawOutcome::Failed(e) => {
                    scores.push(None);
                    failed += 1;
                    tracing::warn!(error = %e, "reconstruction: draw failed");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
                DrawOutcome::Abandoned => {
                    scores.push(None);
                    abandoned += 1;
                }
            }
        }

        if self.config.failure_policy == SampleFailurePolicy::Abort {
            if let Some(e) = first_failure {
                return Err(e);
            }
        }

        if abandoned > 0 {
            tracing::warn!(
                abandoned,
                deadline = ?self.config.deadline,
                "reconstruction: deadline reached"
            );
        }

        let Some(winner) = best else {
            return Err(match (first_failure, self.config.deadline) {
                (_, Some(limit)) if abandoned > 0 => ReconstructionError::DeadlineExceeded(limit),
                (Some(first), _) => ReconstructionError::AllSamplesFailed {
                    samples: n,
                    first: Box::new(first),
                },
                (None, _) => ReconstructionError::NoSamples,
            });
        };

        let elapsed = started.elapsed();
        tracing::info!(
            draw = winner.draw,
            score = winner.score,
            failed,
            abandoned,
            elapsed_ms = elapsed.as_millis() as u64,
            "reconstruction: best sample selected"
        );

        Ok(Reconstruction {
            image: winner.image,
            score: winner.score,
            draw: winner.draw,
            scores,
            elapsed,
        })
    }

    fn draw(
        &self,
        input: &ImageTensor,
        original_gray: &[f32],
        draw: usize,
    ) -> Result<ReconstructionCandidate, ReconstructionError> {
        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(draw as u64)),
            None => StdRng::from_entropy(),
        };

        let image = self
            .sampler
            .sample(input, &mut rng)
            .map_err(|source| ReconstructionError::Sampler { draw, source })?
            .clipped();

        if image.width() != input.width() || image.height() != input.height() {
            return Err(ReconstructionError::ShapeMismatch {
                draw,
                width: input.width(),
                height: input.height(),
                got_width: image.width(),
                got_height: image.height(),
            });
        }

        let gray = image.grayscale();
        let score = ssim::structural_similarity(
            original_gray,
            &gray,
            image.width() as usize,
            image.height() as usize,
            ssim::dynamic_range(&gray),
        )?;

        tracing::debug!(draw, score, "reconstruction: draw scored");
        Ok(ReconstructionCandidate { draw, image, score })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::AtomicUsize;

    fn sketch(size: u32) -> ImageTensor {
        let s = size as usize;
        let data = (0..s * s)
            .flat_map(|i| {
                let v = ((i % s) * (i / s)) as f32 / (s * s) as f32;
                [v, v * 0.5, 1.0 - v]
            })
            .collect();
        ImageTensor::from_hwc(size, size, data).unwrap()
    }

    /// Adds per-draw noise of a random amplitude; output may leave [0, 1].
    struct NoisySampler;

    impl Sampler for NoisySampler {
        fn sample(
            &self,
            input: &ImageTensor,
            rng: &mut StdRng,
        ) -> Result<ImageTensor, SampleError> {
            let amplitude: f32 = rng.gen_range(0.0..0.4);
            let data = input
                .as_slice()
                .iter()
                .map(|v| v + rng.gen_range(-amplitude..=amplitude))
                .collect();
            Ok(ImageTensor::from_hwc(input.width(), input.height(), data)?)
        }
    }

    /// Fails on the given call numbers (0-based), otherwise echoes the input.
    struct FlakySampler {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    impl Sampler for FlakySampler {
        fn sample(
            &self,
            input: &ImageTensor,
            _rng: &mut StdRng,
        ) -> Result<ImageTensor, SampleError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.contains(&call) {
                return Err(SampleError::InferenceFailed(format!("call {call}")));
            }
            Ok(input.clone())
        }
    }

    struct ConstantSampler(f32);

    impl Sampler for ConstantSampler {
        fn sample(
            &self,
            input: &ImageTensor,
            _rng: &mut StdRng,
        ) -> Result<ImageTensor, SampleError> {
            let data = vec![self.0; input.as_slice().len()];
            Ok(ImageTensor::from_hwc(input.width(), input.height(), data)?)
        }
    }

    struct WrongSizeSampler;

    impl Sampler for WrongSizeSampler {
        fn sample(
            &self,
            _input: &ImageTensor,
            _rng: &mut StdRng,
        ) -> Result<ImageTensor, SampleError> {
            Ok(ImageTensor::from_hwc(8, 8, vec![0.5; 8 * 8 * 3])?)
        }
    }

    fn seeded(samples: usize, seed: u64) -> ReconstructorConfig {
        ReconstructorConfig {
            samples,
            seed: Some(seed),
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_samples_rejected() {
        let r = Reconstructor::new(NoisySampler, seeded(0, 1));
        assert!(matches!(r.reconstruct(&sketch(16)), Err(ReconstructionError::NoSamples)));
    }

    #[test]
    fn test_winner_is_one_of_the_samples_with_max_score() {
        let input = sketch(24);
        let r = Reconstructor::new(NoisySampler, seeded(12, 42));
        let result = r.reconstruct(&input).unwrap();

        // Replay the winning draw with its seed: pixel data must match exactly.
        let mut rng = StdRng::seed_from_u64(42 + result.draw as u64);
        let replay = NoisySampler.sample(&input, &mut rng).unwrap().clipped();
        assert_eq!(replay, result.image);

        let max = result.scores.iter().flatten().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!((result.score - max).abs() < 1e-12);
        assert_eq!(result.scores.len(), 12);
        assert!(result.scores.iter().all(Option::is_some));
    }

    #[test]
    fn test_seeded_runs_are_deterministic() {
        let input = sketch(16);
        let a = Reconstructor::new(NoisySampler, seeded(8, 7)).reconstruct(&input).unwrap();
        let b = Reconstructor::new(NoisySampler, seeded(8, 7)).reconstruct(&input).unwrap();
        assert_eq!(a.draw, b.draw);
        assert_eq!(a.scores, b.scores);
        assert_eq!(a.image, b.image);
    }

    #[test]
    fn test_output_is_clipped() {
        let r = Reconstructor::new(ConstantSampler(3.0), seeded(2, 0));
        let result = r.reconstruct(&sketch(16)).unwrap();
        assert!(result.image.as_slice().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_ties_keep_first_draw() {
        // Identical outputs score identically; draw 0 must win.
        let r = Reconstructor::new(ConstantSampler(0.5), seeded(5, 0));
        let result = r.reconstruct(&sketch(16)).unwrap();
        assert_eq!(result.draw, 0);
    }

    #[test]
    fn test_perfect_echo_scores_one() {
        let flaky = FlakySampler { calls: AtomicUsize::new(0), fail_on: vec![] };
        let r = Reconstructor::new(flaky, seeded(3, 0));
        let result = r.reconstruct(&sketch(16)).unwrap();
        assert!((result.score - 1.0).abs() < 1e-9, "score = {}", result.score);
    }

    #[test]
    fn test_abort_policy_fails_whole_batch() {
        let flaky = FlakySampler { calls: AtomicUsize::new(0), fail_on: vec![2] };
        let config = ReconstructorConfig {
            failure_policy: SampleFailurePolicy::Abort,
            ..seeded(6, 0)
        };
        let err = Reconstructor::new(flaky, config).reconstruct(&sketch(16)).unwrap_err();
        assert!(matches!(err, ReconstructionError::Sampler { .. }), "got {err}");
    }

    #[test]
    fn test_skip_policy_isolates_failed_draw() {
        let flaky = FlakySampler { calls: AtomicUsize::new(0), fail_on: vec![1, 3] };
        let r = Reconstructor::new(flaky, seeded(6, 0));
        let result = r.reconstruct(&sketch(16)).unwrap();
        assert_eq!(result.scores.iter().filter(|s| s.is_none()).count(), 2);
        assert_eq!(result.scores.iter().filter(|s| s.is_some()).count(), 4);
    }

    #[test]
    fn test_skip_policy_all_failed() {
        let flaky = FlakySampler { calls: AtomicUsize::new(0), fail_on: (0..4).collect() };
        let err = Reconstructor::new(flaky, seeded(4, 0)).reconstruct(&sketch(16)).unwrap_err();
        assert!(
            matches!(err, ReconstructionError::AllSamplesFailed { samples: 4, .. }),
            "got {err}"
        );
    }

    #[test]
    fn test_zero_deadline_abandons_everything() {
        let config = ReconstructorConfig {
            deadline: Some(Duration::ZERO),
            ..seeded(4, 0)
        };
        let err = Reconstructor::new(NoisySampler, config).reconstruct(&sketch(16)).unwrap_err();
        assert!(matches!(err, ReconstructionError::DeadlineExceeded(_)), "got {err}");
    }

    #[test]
    fn test_wrong_output_size_is_a_draw_failure() {
        let config = ReconstructorConfig {
            failure_policy: SampleFailurePolicy::Abort,
            ..seeded(1, 0)
        };
        let err = Reconstructor::new(WrongSizeSampler, config)
            .reconstruct(&sketch(16))
            .unwrap_err();
        assert!(
            matches!(err, ReconstructionError::ShapeMismatch { got_width: 8, .. }),
            "got {err}"
        );
    }

    #[test]
    fn test_reconstruct_file_writes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("sketch.png");
        sketch(32).to_rgb8().save(&input).unwrap();
        let output = dir.path().join("out").join("reconstructed_image.png");

        let config = ReconstructorConfig {
            input_size: 32,
            ..seeded(3, 9)
        };
        let result = Reconstructor::new(NoisySampler, config)
            .reconstruct_file(&input, &output)
            .unwrap();
        let written = image::open(&output).unwrap().to_rgb8();
        assert_eq!(written.dimensions(), (32, 32));
        assert_eq!(written, result.image.to_rgb8());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Abort".parse::<SampleFailurePolicy>(), Ok(SampleFailurePolicy::Abort));
        assert_eq!(" skip ".parse::<SampleFailurePolicy>(), Ok(SampleFailurePolicy::Skip));
        assert!("retry".parse::<SampleFailurePolicy>().is_err());
    }

    #[test]
    fn test_default_policy_is_skip() {
        assert_eq!(SampleFailurePolicy::default(), SampleFailurePolicy::Skip);
        assert_eq!(ReconstructorConfig::default().failure_policy, SampleFailurePolicy::Skip);
    }
}
