use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::audio::{AudioSource, SymphoniaSource};
use crate::cache::TempoCache;
use crate::config::CompasConfig;
use crate::detect::DetectorRegistry;
use crate::storage::AnalysisStore;

/// The shared collaborators of a batch run, constructed explicitly and
/// passed down instead of living in module-level globals.
///
/// Opened once at batch start and dropped at batch end; the cache and the
/// store are the only pieces of state concurrent workers share.
pub struct AnalysisContext {
    pub registry: Arc<DetectorRegistry>,
    pub source: Arc<dyn AudioSource>,
    pub cache: Arc<TempoCache>,
    pub store: Option<Arc<AnalysisStore>>,
}

impl AnalysisContext {
    /// Wires the default collaborators from configuration: built-in
    /// detectors, symphonia loading, and cache/store per the batch config.
    /// An unreachable database or cache dir fails here, before any
    /// file-level work begins.
    pub fn open(config: &CompasConfig) -> Result<Self> {
        config.analysis.validate()?;

        let cache = match &config.batch.cache_dir {
            Some(dir) => TempoCache::with_disk(dir)?,
            None => TempoCache::in_memory(),
        };

        let store = match &config.batch.database {
            Some(path) => Some(Arc::new(AnalysisStore::open(path)?)),
            None => None,
        };

        info!(
            cache_dir = ?config.batch.cache_dir,
            database = ?config.batch.database,
            "analysis context opened"
        );

        Ok(AnalysisContext {
            registry: Arc::new(DetectorRegistry::with_defaults()),
            source: Arc::new(SymphoniaSource),
            cache: Arc::new(cache),
            store,
        })
    }

    /// Swaps the detector registry, e.g. to add externally provided variants.
    pub fn with_registry(mut self, registry: DetectorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Swaps the audio loader.
    pub fn with_source(mut self, source: Arc<dyn AudioSource>) -> Self {
        self.source = source;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompasConfig;

    #[test]
    fn open_with_defaults() {
        let context = AnalysisContext::open(&CompasConfig::default()).unwrap();
        assert!(context.store.is_none());
        assert!(context.cache.is_empty());
        assert_eq!(context.registry.names(), vec!["energy", "grid"]);
    }

    #[test]
    fn open_with_store_and_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CompasConfig::default();
        config.batch.cache_dir = Some(dir.path().join("cache"));
        config.batch.database = Some(dir.path().join("compas.db"));

        let context = AnalysisContext::open(&config).unwrap();
        assert!(context.store.is_some());
    }

    #[test]
    fn invalid_config_fails_before_any_work() {
        let mut config = CompasConfig::default();
        config.analysis.confidence_threshold = 3.0;
        assert!(AnalysisContext::open(&config).is_err());
    }
}
