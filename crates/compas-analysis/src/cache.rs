use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use compas_core::TempoMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Full identity of one cached result. A changed file (new checksum) or a
/// changed detector configuration (new config hash) simply misses; entries
/// are never invalidated on age alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub checksum: String,
    pub algorithm: String,
    pub config_hash: String,
}

impl CacheKey {
    pub fn new(
        checksum: impl Into<String>,
        algorithm: impl Into<String>,
        config_hash: impl Into<String>,
    ) -> Self {
        CacheKey {
            checksum: checksum.into(),
            algorithm: algorithm.into(),
            config_hash: config_hash.into(),
        }
    }

    fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.checksum.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.algorithm.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.config_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    created_at: u64,
    map: TempoMap,
}

/// Content-addressed tempo-map cache.
///
/// A memory tier holds the running batch's working set; an optional disk tier
/// makes hits survive across runs. Both tiers are safe under concurrent
/// readers and writers: racing puts for the same key are idempotent
/// (identical inputs produce identical maps) and resolve last-write-wins.
pub struct TempoCache {
    memory: Mutex<HashMap<CacheKey, TempoMap>>,
    disk_dir: Option<PathBuf>,
}

impl TempoCache {
    pub fn in_memory() -> Self {
        TempoCache {
            memory: Mutex::new(HashMap::new()),
            disk_dir: None,
        }
    }

    pub fn with_disk(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(TempoCache {
            memory: Mutex::new(HashMap::new()),
            disk_dir: Some(dir),
        })
    }

    pub fn get(&self, key: &CacheKey) -> Option<TempoMap> {
        if let Some(map) = self.memory.lock().unwrap().get(key) {
            return Some(map.clone());
        }

        let path = self.entry_path(key)?;
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice::<DiskEntry>(&bytes) {
            Ok(entry) => {
                // serde skips the validating constructor, so a tampered or
                // truncated-then-rewritten entry could still parse.
                if let Err(error) = entry.map.validate() {
                    warn!(path = %path.display(), %error, "cached tempo map is invalid, treating as miss");
                    return None;
                }
                self.memory.lock().unwrap().insert(key.clone(), entry.map.clone());
                Some(entry.map)
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "corrupt cache entry, treating as miss");
                None
            }
        }
    }

    pub fn put(&self, key: &CacheKey, map: &TempoMap) {
        self.memory.lock().unwrap().insert(key.clone(), map.clone());

        if let Some(path) = self.entry_path(key) {
            if let Err(error) = write_entry(&path, map) {
                warn!(path = %path.display(), %error, "failed to write cache entry");
            } else {
                debug!(path = %path.display(), "cache entry written");
            }
        }
    }

    /// Entries resident in the memory tier.
    pub fn len(&self) -> usize {
        self.memory.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `<dir>/<first nibble>/<first two nibbles>/<digest>.json`, fanning the
    /// entries out so no directory grows unbounded.
    fn entry_path(&self, key: &CacheKey) -> Option<PathBuf> {
        let dir = self.disk_dir.as_ref()?;
        let digest = key.digest();
        Some(
            dir.join(&digest[0..1])
                .join(&digest[0..2])
                .join(format!("{digest}.json")),
        )
    }
}

fn write_entry(path: &Path, map: &TempoMap) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let entry = DiskEntry {
        created_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
        map: map.clone(),
    };
    let bytes = serde_json::to_vec(&entry)?;

    // Write-then-rename keeps readers from ever seeing a half-written entry.
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::detect::Detector;
    use crate::testing::{StubDetector, click_audio};

    fn sample_map() -> TempoMap {
        StubDetector
            .detect(&click_audio(10.0, 120.0, 8000), &DetectorConfig::default())
            .unwrap()
    }

    fn sample_key() -> CacheKey {
        CacheKey::new("abc123", "stub", DetectorConfig::default().content_hash())
    }

    #[test]
    fn memory_round_trip_is_structural() {
        let cache = TempoCache::in_memory();
        let key = sample_key();
        let map = sample_map();

        assert!(cache.get(&key).is_none());
        cache.put(&key, &map);
        assert_eq!(cache.get(&key).unwrap(), map);
    }

    #[test]
    fn disk_entries_survive_a_new_cache_instance() {
        let dir = tempfile::tempdir().unwrap();
        let key = sample_key();
        let map = sample_map();

        let cache = TempoCache::with_disk(dir.path()).unwrap();
        cache.put(&key, &map);
        drop(cache);

        let reopened = TempoCache::with_disk(dir.path()).unwrap();
        assert_eq!(reopened.get(&key).unwrap(), map);
    }

    #[test]
    fn key_parts_are_all_significant() {
        let cache = TempoCache::in_memory();
        let map = sample_map();
        cache.put(&sample_key(), &map);

        assert!(cache.get(&CacheKey::new("other", "stub", "cfg")).is_none());
        assert!(cache.get(&CacheKey::new("abc123", "other", "cfg")).is_none());
        assert!(
            cache
                .get(&CacheKey::new("abc123", "stub", "other-config"))
                .is_none()
        );
    }

    #[test]
    fn unparseable_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TempoCache::with_disk(dir.path()).unwrap();
        let key = sample_key();

        let path = cache.entry_path(&key).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();

        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn parseable_but_invalid_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TempoCache::with_disk(dir.path()).unwrap();
        let key = sample_key();

        let garbage = r#"{"created_at": 0, "map": {
            "beats": [
                {"time": 2.0, "position": 1, "confidence": 0.9, "tempo_at_beat": 120.0},
                {"time": 1.0, "position": 2, "confidence": 0.9, "tempo_at_beat": 120.0}
            ],
            "average_bpm": 120.0,
            "algorithm": "stub",
            "duration": 10.0,
            "beats_per_measure": 4,
            "segments": []
        }}"#;
        let path = cache.entry_path(&key).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, garbage).unwrap();

        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn racing_puts_resolve_last_write_wins() {
        let cache = TempoCache::in_memory();
        let key = sample_key();
        let first = sample_map();
        let second = StubDetector
            .detect(&click_audio(12.0, 120.0, 8000), &DetectorConfig::default())
            .unwrap();
        assert_ne!(first, second);

        cache.put(&key, &first);
        cache.put(&key, &second);
        assert_eq!(cache.get(&key).unwrap(), second);
    }
}
