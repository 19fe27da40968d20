mod energy;
mod grid;

use std::collections::HashMap;
use std::sync::Arc;

use compas_core::{TempoMap, TempoMapError};
use thiserror::Error;
use tracing::debug;

use crate::audio::LoadedAudio;
use crate::config::DetectorConfig;
use crate::error::AnalysisError;

pub use energy::EnergyDetector;
pub use grid::GridDetector;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("audio is too short for beat detection ({seconds:.2}s)")]
    TooShort { seconds: f64 },

    #[error("no stable tempo found")]
    NoTempo,

    #[error("inconsistent detector output: {0}")]
    Construct(#[from] TempoMapError),
}

/// The single capability every algorithm variant implements.
///
/// Implementations are opaque to the rest of the system: whatever confidence
/// values they report are passed through as-is, and any malformed output is
/// caught by `TempoMap` construction, not repaired here.
pub trait Detector: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &'static str;

    fn detect(&self, audio: &LoadedAudio, config: &DetectorConfig) -> Result<TempoMap, DetectError>;
}

/// String-keyed detector lookup. Unknown names fail before any audio I/O.
pub struct DetectorRegistry {
    detectors: HashMap<String, Arc<dyn Detector>>,
}

impl DetectorRegistry {
    pub fn empty() -> Self {
        DetectorRegistry {
            detectors: HashMap::new(),
        }
    }

    /// Registry with the built-in variants.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(EnergyDetector));
        registry.register(Arc::new(GridDetector));
        registry
    }

    pub fn register(&mut self, detector: Arc<dyn Detector>) {
        debug!(algorithm = detector.id(), "registering detector");
        self.detectors.insert(detector.id().to_string(), detector);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Detector>, AnalysisError> {
        self.detectors
            .get(name)
            .cloned()
            .ok_or_else(|| AnalysisError::UnsupportedAlgorithm(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.detectors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Fold a raw BPM estimate into the configured range by octave doubling or
/// halving, the usual correction for detectors locking onto half/double time.
pub(crate) fn fold_into_range(mut bpm: f64, (min, max): (f64, f64)) -> f64 {
    while bpm < min && bpm * 2.0 <= max {
        bpm *= 2.0;
    }
    while bpm > max && bpm / 2.0 >= min {
        bpm /= 2.0;
    }
    bpm
}
