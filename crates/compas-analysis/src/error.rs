use std::time::Duration;

use compas_core::TempoMapError;
use thiserror::Error;

use crate::audio::AudioLoadError;
use crate::detect::DetectError;

/// Failure of one file's analysis run.
///
/// Every variant is local to the file it occurred on; the batch processor
/// collects these per file and never lets one abort the run as a whole.
/// Persistence failures are deliberately absent: a storage error after a
/// successful detection degrades the run outcome instead of failing it (see
/// `orchestrator::PersistStatus`).
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    AudioLoad(#[from] AudioLoadError),

    #[error("unknown algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("detector '{algorithm}' failed: {source}")]
    Detector {
        algorithm: String,
        #[source]
        source: DetectError,
    },

    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("detector produced an invalid tempo map: {0}")]
    InvalidTempoMap(#[from] TempoMapError),

    #[error("analysis worker failed: {0}")]
    Worker(String),
}
