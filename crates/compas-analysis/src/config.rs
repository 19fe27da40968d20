use std::path::PathBuf;
use std::time::Duration;

use config::{Config, File, FileFormat};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Configuration parse error: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Knobs forwarded to detectors. Every field participates in the cache's
/// config hash, so changing any of them naturally misses old entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Plausible tempo range in BPM; estimates are octave-folded into it.
    pub tempo_range: (f64, f64),
    pub beats_per_measure: u32,
    pub window_size: usize,
    pub hop_size: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            tempo_range: (30.0, 300.0),
            beats_per_measure: 4,
            window_size: 2048,
            hop_size: 512,
        }
    }
}

impl DetectorConfig {
    /// Stable hex digest of the configuration, used as the cache key part.
    pub fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("detector config serializes");
        hex::encode(Sha256::digest(bytes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct AnalysisConfig {
    /// Registry key of the detector to run.
    pub algorithm: String,
    /// Drop beats below this confidence after detection (0.0 keeps all).
    pub confidence_threshold: f64,
    pub detector: DetectorConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            algorithm: "energy".to_string(),
            confidence_threshold: 0.0,
            detector: DetectorConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min, max) = self.detector.tempo_range;
        if !(min > 0.0 && max > min) {
            return Err(ConfigError::Invalid(format!(
                "tempo_range must be an ordered positive pair, got ({min}, {max})"
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.detector.beats_per_measure == 0 {
            return Err(ConfigError::Invalid("beats_per_measure must be at least 1".into()));
        }
        if self.detector.window_size < 256 {
            return Err(ConfigError::Invalid("window_size must be at least 256".into()));
        }
        if self.detector.hop_size == 0 || self.detector.hop_size > self.detector.window_size {
            return Err(ConfigError::Invalid(
                "hop_size must be in [1, window_size]".into(),
            ));
        }
        Ok(())
    }
}

/// What to do with in-flight work when a batch is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// Let started files run to completion; only stop scheduling new ones.
    Drain,
    /// Stop waiting on started files too; their results are discarded.
    Abandon,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        CancelPolicy::Drain
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
#[builder(setter(into, strip_option), default)]
pub struct BatchConfig {
    /// Fixed worker count; `None` derives one from `cpu_percent`.
    pub workers: Option<usize>,
    /// Share of logical CPUs to use when `workers` is unset (0.0–100.0).
    pub cpu_percent: f32,
    /// Upper bound on one file's load + detect time.
    #[serde(with = "humantime_serde")]
    pub file_timeout: Duration,
    pub cancel_policy: CancelPolicy,
    /// Directory for the durable tempo-map cache; `None` keeps it in memory.
    pub cache_dir: Option<PathBuf>,
    /// SQLite database for analysis persistence; `None` disables it.
    pub database: Option<PathBuf>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            workers: None,
            cpu_percent: 50.0,
            file_timeout: Duration::from_secs(120),
            cancel_policy: CancelPolicy::default(),
            cache_dir: None,
            database: None,
        }
    }
}

impl BatchConfig {
    pub fn effective_workers(&self) -> usize {
        if let Some(workers) = self.workers {
            return workers.max(1);
        }
        let by_percent = (num_cpus::get() as f32 * self.cpu_percent / 100.0).ceil() as usize;
        by_percent.clamp(1, 100)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompasConfig {
    pub analysis: AnalysisConfig,
    pub batch: BatchConfig,
}

impl CompasConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let cfg = Config::builder()
            .add_source(File::new(&path, FileFormat::Toml))
            .build()
            .map_err(ConfigError::Parse)?;
        let parsed = cfg.try_deserialize::<CompasConfig>().map_err(ConfigError::Parse)?;
        parsed.analysis.validate()?;
        Ok(parsed)
    }

    pub fn to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let rendered = toml::to_string_pretty(self)?;
        std::fs::write(path, rendered)?;
        Ok(())
    }
}
