use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identity record for one audio source.
///
/// The checksum is a SHA-256 over the raw file bytes and is the key used for
/// caching and deduplication: two records with the same checksum but
/// different paths refer to the same source material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioMeta {
    pub path: PathBuf,
    pub checksum: String,
    /// Duration in seconds.
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u32,
}
