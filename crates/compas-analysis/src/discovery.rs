use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_walkdir::WalkDir;
use bytesize::ByteSize;
use futures::StreamExt;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Extensions the analysis pipeline accepts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SupportedExtension {
    Mp3,
    Wav,
    Flac,
    M4a,
    Ogg,
}

impl SupportedExtension {
    pub const ALL: &'static [SupportedExtension] = &[
        SupportedExtension::Mp3,
        SupportedExtension::Wav,
        SupportedExtension::Flac,
        SupportedExtension::M4a,
        SupportedExtension::Ogg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SupportedExtension::Mp3 => "mp3",
            SupportedExtension::Wav => "wav",
            SupportedExtension::Flac => "flac",
            SupportedExtension::M4a => "m4a",
            SupportedExtension::Ogg => "ogg",
        }
    }

    /// Smallest file size worth analyzing; anything below is noise or a
    /// truncated download.
    pub fn min_file_size(&self) -> ByteSize {
        match self {
            SupportedExtension::Mp3 => ByteSize::kib(32),
            SupportedExtension::Wav => ByteSize::kib(256),
            SupportedExtension::Flac => ByteSize::kib(128),
            SupportedExtension::M4a => ByteSize::kib(32),
            SupportedExtension::Ogg => ByteSize::kib(32),
        }
    }
}

impl FromStr for SupportedExtension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        SupportedExtension::ALL
            .iter()
            .find(|ext| ext.as_str() == lower)
            .copied()
            .ok_or_else(|| format!("Extension not supported: {s}"))
    }
}

/// Walks the given roots and returns the audio files worth analyzing:
/// supported extension, above the per-format size floor, not under an
/// excluded prefix. Walk errors are logged and skipped, never fatal.
pub async fn scan(roots: &[PathBuf], exclude: &[PathBuf]) -> Vec<PathBuf> {
    let excluded = normalize_paths(exclude);
    let mut found = Vec::new();

    for root in normalize_paths(roots) {
        let mut walker = WalkDir::new(root).into_stream();
        while let Some(entry) = walker.next().await {
            match entry {
                Ok(entry) => {
                    let path = entry.path().to_path_buf();
                    if excluded.iter().any(|prefix| path.starts_with(prefix)) {
                        continue;
                    }
                    if let Some(path) = candidate(&path).await {
                        found.push(path);
                    }
                }
                Err(error) => warn!(?error, "walkdir error"),
            }
        }
    }

    found.sort();
    found.dedup();
    found
}

async fn candidate(path: &Path) -> Option<PathBuf> {
    let ext = path.extension().and_then(OsStr::to_str)?;
    let variant = SupportedExtension::from_str(ext).ok()?;

    let metadata = tokio::fs::metadata(path).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    if metadata.len() < variant.min_file_size().as_u64() {
        return None;
    }

    Some(path.to_path_buf())
}

fn normalize_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter_map(|p| dunce::canonicalize(p).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, len: usize) {
        std::fs::write(path, vec![0u8; len]).unwrap();
    }

    #[tokio::test]
    async fn finds_only_supported_files_above_the_size_floor() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("keep.mp3"), 64 * 1024);
        write_file(&dir.path().join("tiny.mp3"), 128);
        write_file(&dir.path().join("notes.txt"), 64 * 1024);

        let found = scan(&[dir.path().to_path_buf()], &[]).await;
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("keep.mp3"));
    }

    #[tokio::test]
    async fn excluded_prefixes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let skip_dir = dir.path().join("skip");
        std::fs::create_dir(&skip_dir).unwrap();
        write_file(&dir.path().join("keep.mp3"), 64 * 1024);
        write_file(&skip_dir.join("drop.mp3"), 64 * 1024);

        let found = scan(&[dir.path().to_path_buf()], &[skip_dir]).await;
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("keep.mp3"));
    }

    #[test]
    fn extension_parsing_is_case_insensitive() {
        assert_eq!("MP3".parse::<SupportedExtension>().unwrap(), SupportedExtension::Mp3);
        assert!("exe".parse::<SupportedExtension>().is_err());
    }
}
