use anyhow::Context;
use serde::{Deserialize, Serialize};
use sketchface_core::confidence::DEFAULT_MAX_DISTANCE;
use sketchface_core::embedder::DEFAULT_EMBEDDING_INPUT_SIZE;
use sketchface_core::reconstructor::{DEFAULT_INPUT_SIZE, DEFAULT_SAMPLES};
use sketchface_core::{
    ConfidenceScale, EmbedderOptions, MatcherConfig, ReconstructorConfig, SampleFailurePolicy,
    TensorLayout,
    VaeOptions,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Pipeline configuration.
///
/// Built from defaults, then an optional TOML file, then `SKETCHFACE_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub sampler_model: String,
    pub detector_model: String,
    pub embedder_model: String,
    pub sampler_layout: TensorLayout,
    /// Latent size for VAE exports that take the noise as a second input.
    pub latent_dim: Option<usize>,
    pub embedder_layout: TensorLayout,
    pub embedding_input_size: u32,
    /// Expected embedding length; unset accepts any.
    pub embedding_dim: Option<usize>,
    pub l2_normalize: bool,
    /// Number of VAE draws per sketch.
    pub samples: usize,
    /// Base seed for reproducible runs; unset draws from OS entropy.
    pub seed: Option<u64>,
    pub failure_policy: SampleFailurePolicy,
    /// Square input resolution of the VAE.
    pub input_size: u32,
    /// Reference distance for the confidence scale.
    pub max_distance: f32,
    /// Where the winning reconstruction is written (overwritten per request).
    pub output_path: PathBuf,
    /// Flat directory of candidate photos.
    pub pool_dir: PathBuf,
    /// JSON array of `{name, crime, photo}` entries.
    pub records_path: PathBuf,
    pub logs_dir: PathBuf,
    /// Copy every upload and its reconstruction under `logs_dir`.
    pub archive: bool,
    pub reconstruct_timeout_secs: Option<u64>,
    pub scan_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let embedder = EmbedderOptions::default();
        Self {
            model_dir: default_model_dir(),
            sampler_model: "vae.onnx".to_string(),
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: "facenet512.onnx".to_string(),
            sampler_layout: TensorLayout::Nhwc,
            latent_dim: None,
            embedder_layout: embedder.layout,
            embedding_input_size: DEFAULT_EMBEDDING_INPUT_SIZE,
            embedding_dim: embedder.dim,
            l2_normalize: embedder.l2_normalize,
            samples: DEFAULT_SAMPLES,
            seed: None,
            failure_policy: SampleFailurePolicy::default(),
            input_size: DEFAULT_INPUT_SIZE,
            max_distance: DEFAULT_MAX_DISTANCE,
            output_path: PathBuf::from("temp/reconstructed_image.png"),
            pool_dir: PathBuf::from("photos"),
            records_path: PathBuf::from("criminal_records.json"),
            logs_dir: PathBuf::from("logs"),
            archive: true,
            reconstruct_timeout_secs: None,
            scan_timeout_secs: None,
        }
    }
}

/// `$XDG_DATA_HOME/sketchface/models`, falling back to `~/.local/share`.
fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("sketchface/models")
}

impl Config {
    /// Load configuration: defaults, then `file` if given, then the environment.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply `SKETCHFACE_*` overrides. Unparseable values keep the current setting.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env(&lookup);

        self.model_dir = env.path("SKETCHFACE_MODEL_DIR", &self.model_dir);
        self.sampler_model = env.string("SKETCHFACE_SAMPLER_MODEL", &self.sampler_model);
        self.detector_model = env.string("SKETCHFACE_DETECTOR_MODEL", &self.detector_model);
        self.embedder_model = env.string("SKETCHFACE_EMBEDDER_MODEL", &self.embedder_model);
        self.sampler_layout = env.parse("SKETCHFACE_SAMPLER_LAYOUT", self.sampler_layout);
        self.latent_dim = env.optional("SKETCHFACE_LATENT_DIM", self.latent_dim);
        self.embedder_layout = env.parse("SKETCHFACE_EMBEDDER_LAYOUT", self.embedder_layout);
        self.embedding_input_size =
            env.parse("SKETCHFACE_EMBEDDING_INPUT_SIZE", self.embedding_input_size);
        self.embedding_dim = env.optional("SKETCHFACE_EMBEDDING_DIM", self.embedding_dim);
        self.l2_normalize = env.flag("SKETCHFACE_L2_NORMALIZE", self.l2_normalize);
        self.samples = env.parse("SKETCHFACE_SAMPLES", self.samples);
        self.seed = env.optional("SKETCHFACE_SEED", self.seed);
        self.failure_policy = env.parse("SKETCHFACE_FAILURE_POLICY", self.failure_policy);
        self.input_size = env.parse("SKETCHFACE_INPUT_SIZE", self.input_size);
        self.max_distance = env.parse("SKETCHFACE_MAX_DISTANCE", self.max_distance);
        self.output_path = env.path("SKETCHFACE_OUTPUT_PATH", &self.output_path);
        self.pool_dir = env.path("SKETCHFACE_POOL_DIR", &self.pool_dir);
        self.records_path = env.path("SKETCHFACE_RECORDS_PATH", &self.records_path);
        self.logs_dir = env.path("SKETCHFACE_LOGS_DIR", &self.logs_dir);
        self.archive = env.flag("SKETCHFACE_ARCHIVE", self.archive);
        self.reconstruct_timeout_secs =
            env.optional("SKETCHFACE_RECONSTRUCT_TIMEOUT_SECS", self.reconstruct_timeout_secs);
        self.scan_timeout_secs =
            env.optional("SKETCHFACE_SCAN_TIMEOUT_SECS", self.scan_timeout_secs);
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.samples >= 1, "samples must be at least 1");
        anyhow::ensure!(self.input_size >= 7, "input_size must be at least 7 (SSIM window)");
        anyhow::ensure!(self.embedding_input_size > 0, "embedding_input_size must be positive");
        anyhow::ensure!(
            self.max_distance.is_finite() && self.max_distance > 0.0,
            "max_distance must be a positive number"
        );
        Ok(())
    }

    pub fn sampler_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.sampler_model)
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedder_model)
    }

    pub fn vae_options(&self) -> VaeOptions {
        VaeOptions {
            layout: self.sampler_layout,
            latent_dim: self.latent_dim,
        }
    }

    pub fn embedder_options(&self) -> EmbedderOptions {
        EmbedderOptions {
            input_size: self.embedding_input_size,
            layout: self.embedder_layout,
            dim: self.embedding_dim,
            l2_normalize: self.l2_normalize,
            ..Default::default()
        }
    }

    pub fn reconstructor_config(&self) -> ReconstructorConfig {
        ReconstructorConfig {
            samples: self.samples,
            seed: self.seed,
            failure_policy: self.failure_policy,
            deadline: self.reconstruct_timeout_secs.map(Duration::from_secs),
            input_size: self.input_size,
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            scan_deadline: self.scan_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn confidence_scale(&self) -> ConfidenceScale {
        ConfidenceScale::new(self.max_distance)
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn var(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, current: &str) -> String {
        self.var(key).unwrap_or_else(|| current.to_string())
    }

    fn path(&self, key: &str, current: &Path) -> PathBuf {
        self.var(key).map(PathBuf::from).unwrap_or_else(|| current.to_path_buf())
    }

    fn parse<T: FromStr>(&self, key: &str, current: T) -> T {
        match self.var(key) {
            Some(v) => v.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %v, "ignoring unparseable setting");
                current
            }),
            None => current,
        }
    }

    /// `0`, `none` or `off` clear an optional setting.
    fn optional<T: FromStr>(&self, key: &str, current: Option<T>) -> Option<T> {
        match self.var(key) {
            Some(v) if matches!(v.as_str(), "0" | "none" | "off") => None,
            Some(v) => match v.parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    tracing::warn!(key, value = %v, "ignoring unparseable setting");
                    current
                }
            },
            None => current,
        }
    }

    fn flag(&self, key: &str, current: bool) -> bool {
        self.var(key).map(|v| v != "0" && v != "false").unwrap_or(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.samples, 50);
        assert_eq!(c.input_size, 256);
        assert_eq!(c.max_distance, 10.0);
        assert_eq!(c.failure_policy, SampleFailurePolicy::Skip);
        assert!(c.archive);
        assert!(c.seed.is_none());
        assert!(c.sampler_model_path().ends_with("vae.onnx"));
        c.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut c = Config::default();
        c.apply_overrides(lookup(&[
            ("SKETCHFACE_MODEL_DIR", "/opt/models"),
            ("SKETCHFACE_SAMPLES", "12"),
            ("SKETCHFACE_SEED", "99"),
            ("SKETCHFACE_FAILURE_POLICY", "abort"),
            ("SKETCHFACE_MAX_DISTANCE", "1.2"),
            ("SKETCHFACE_ARCHIVE", "0"),
            ("SKETCHFACE_SAMPLER_LAYOUT", "nchw"),
            ("SKETCHFACE_SCAN_TIMEOUT_SECS", "30"),
        ]));
        assert_eq!(c.detector_model_path(), PathBuf::from("/opt/models/det_10g.onnx"));
        assert_eq!(c.samples, 12);
        assert_eq!(c.seed, Some(99));
        assert_eq!(c.failure_policy, SampleFailurePolicy::Abort);
        assert_eq!(c.confidence_scale().max_distance, 1.2);
        assert!(!c.archive);
        assert_eq!(c.vae_options().layout, TensorLayout::Nchw);
        assert_eq!(c.matcher_config().scan_deadline, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_bad_env_value_keeps_current() {
        let mut c = Config::default();
        c.apply_overrides(lookup(&[
            ("SKETCHFACE_SAMPLES", "many"),
            ("SKETCHFACE_FAILURE_POLICY", "retry"),
        ]));
        assert_eq!(c.samples, 50);
        assert_eq!(c.failure_policy, SampleFailurePolicy::Skip);
    }

    #[test]
    fn test_optional_can_be_cleared() {
        let mut c = Config {
            seed: Some(5),
            embedding_dim: Some(512),
            ..Default::default()
        };
        c.apply_overrides(lookup(&[
            ("SKETCHFACE_SEED", "none"),
            ("SKETCHFACE_EMBEDDING_DIM", "0"),
        ]));
        assert_eq!(c.seed, None);
        assert_eq!(c.embedding_dim, None);
    }

    #[test]
    fn test_toml_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sketchface.toml");
        std::fs::write(
            &path,
            r#"
samples = 8
seed = 3
pool_dir = "/data/photos"
failure_policy = "abort"
"#,
        )
        .unwrap();

        let mut c = Config::from_file(&path).unwrap();
        assert_eq!(c.samples, 8);
        assert_eq!(c.pool_dir, PathBuf::from("/data/photos"));
        assert_eq!(c.failure_policy, SampleFailurePolicy::Abort);
        // Unset keys keep their defaults.
        assert_eq!(c.max_distance, 10.0);

        c.apply_overrides(lookup(&[("SKETCHFACE_SAMPLES", "20")]));
        assert_eq!(c.samples, 20);
        assert_eq!(c.seed, Some(3));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "sample_count = 3\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_validate() {
        let c = Config {
            samples: 0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
        let c = Config {
            max_distance: 0.0,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
