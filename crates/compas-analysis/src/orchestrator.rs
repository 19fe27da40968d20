use std::path::{Path, PathBuf};
use std::sync::Arc;

use compas_core::{AudioMeta, TempoMap};
use tracing::{debug, warn};

use crate::audio::LoadedAudio;
use crate::cache::CacheKey;
use crate::config::AnalysisConfig;
use crate::context::AnalysisContext;
use crate::detect::Detector;
use crate::error::AnalysisError;
use crate::export::{self, ExportFormat};
use crate::storage::AnalysisId;

/// Where a run currently is. `Failed` absorbs from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Loading,
    Detecting,
    Validating,
    Persisting,
    Exporting,
    Done,
    Failed,
}

/// How persistence went. A storage failure never takes the detection down
/// with it: the outcome still carries the tempo map, only degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistStatus {
    Disabled,
    Stored(AnalysisId),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportStatus {
    Disabled,
    Written(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct ExportTarget {
    pub format: ExportFormat,
    pub dir: PathBuf,
}

/// Everything a finished run produced. Whether the map came from the cache
/// is visible here and nowhere in the map itself.
#[derive(Debug)]
pub struct RunOutcome {
    pub meta: AudioMeta,
    pub tempo_map: TempoMap,
    pub cache_hit: bool,
    pub persisted: PersistStatus,
    pub exported: ExportStatus,
}

/// Drives one file through load → detect → validate → persist → export.
///
/// Runs are independent of each other; the only shared state is the cache
/// and store inside the context, which serialize their own writes.
pub struct Orchestrator {
    context: Arc<AnalysisContext>,
    config: AnalysisConfig,
    export: Option<ExportTarget>,
}

impl Orchestrator {
    pub fn new(context: Arc<AnalysisContext>, config: AnalysisConfig) -> Self {
        Orchestrator {
            context,
            config,
            export: None,
        }
    }

    pub fn with_export(mut self, target: ExportTarget) -> Self {
        self.export = Some(target);
        self
    }

    pub fn run(&self, path: &Path) -> Result<RunOutcome, AnalysisError> {
        // Resolve the algorithm first so configuration mistakes fail before
        // any audio is touched.
        let detector = self.context.registry.get(&self.config.algorithm)?;

        let mut stage = Stage::Idle;
        match self.drive(path, detector, &mut stage) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let from = stage;
                stage = Stage::Failed;
                warn!(path = %path.display(), ?from, ?stage, %error, "analysis failed");
                Err(error)
            }
        }
    }

    fn drive(
        &self,
        path: &Path,
        detector: Arc<dyn Detector>,
        stage: &mut Stage,
    ) -> Result<RunOutcome, AnalysisError> {
        *stage = Stage::Loading;
        debug!(path = %path.display(), ?stage, algorithm = detector.id(), "run started");
        let audio = self.context.source.load(path)?;

        *stage = Stage::Detecting;
        let key = CacheKey::new(
            &audio.meta.checksum,
            detector.id(),
            self.config.detector.content_hash(),
        );
        let (map, cache_hit) = match self.detect_validated(&audio, detector.as_ref(), &key, stage) {
            Ok(result) => result,
            Err(error) => {
                // The file's identity is known at this point, so a configured
                // store gets a failure record for it.
                if let Some(store) = &self.context.store {
                    if let Err(store_error) =
                        store.record_failure(&audio.meta, &self.config.algorithm, &error.to_string())
                    {
                        warn!(%store_error, "failed to record the analysis failure");
                    }
                }
                return Err(error);
            }
        };

        let persisted = match &self.context.store {
            None => PersistStatus::Disabled,
            Some(store) => {
                *stage = Stage::Persisting;
                match store.save(&audio.meta, &map) {
                    Ok(id) => PersistStatus::Stored(id),
                    Err(error) => {
                        warn!(
                            path = %path.display(),
                            %error,
                            "persisting failed, returning the in-memory result"
                        );
                        PersistStatus::Failed(error.to_string())
                    }
                }
            }
        };

        let exported = match &self.export {
            None => ExportStatus::Disabled,
            Some(target) => {
                *stage = Stage::Exporting;
                match export::write_to_dir(target.format, &target.dir, &audio.meta, &map) {
                    Ok(out) => ExportStatus::Written(out),
                    Err(error) => {
                        warn!(path = %path.display(), %error, "export failed");
                        ExportStatus::Failed(error.to_string())
                    }
                }
            }
        };

        *stage = Stage::Done;
        debug!(path = %path.display(), cache_hit, beats = map.beat_count(), "run finished");

        Ok(RunOutcome {
            meta: audio.meta,
            tempo_map: map,
            cache_hit,
            persisted,
            exported,
        })
    }

    fn detect_validated(
        &self,
        audio: &LoadedAudio,
        detector: &dyn Detector,
        key: &CacheKey,
        stage: &mut Stage,
    ) -> Result<(TempoMap, bool), AnalysisError> {
        let (map, cache_hit) = match self.context.cache.get(key) {
            Some(map) => {
                debug!(path = %audio.meta.path.display(), "cache hit");
                (map, true)
            }
            None => {
                let map = detector.detect(audio, &self.config.detector).map_err(|source| {
                    AnalysisError::Detector {
                        algorithm: detector.id().to_string(),
                        source,
                    }
                })?;
                let map = if self.config.confidence_threshold > 0.0 {
                    map.filter_by_confidence(self.config.confidence_threshold)?
                } else {
                    map
                };
                (map, false)
            }
        };

        *stage = Stage::Validating;
        map.validate()?;

        if !cache_hit {
            self.context.cache.put(key, &map);
        }
        Ok((map, cache_hit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfigBuilder;
    use crate::storage::AnalysisStore;
    use crate::testing::stub_context;

    fn config(algorithm: &str) -> AnalysisConfig {
        AnalysisConfigBuilder::default()
            .algorithm(algorithm)
            .build()
            .unwrap()
    }

    #[test]
    fn full_run_produces_an_outcome() {
        let (context, _) = stub_context(None);
        let orchestrator = Orchestrator::new(context, config("stub"));

        let outcome = orchestrator.run(Path::new("/music/a.wav")).unwrap();
        assert!(!outcome.cache_hit);
        assert_eq!(outcome.persisted, PersistStatus::Disabled);
        assert_eq!(outcome.exported, ExportStatus::Disabled);
        assert!(outcome.tempo_map.beat_count() > 10);
        assert_eq!(outcome.meta.path, PathBuf::from("/music/a.wav"));
    }

    #[test]
    fn second_run_is_a_cache_hit_with_an_identical_map() {
        let (context, _) = stub_context(None);
        let orchestrator = Orchestrator::new(context, config("stub"));

        let first = orchestrator.run(Path::new("/music/a.wav")).unwrap();
        let second = orchestrator.run(Path::new("/music/a.wav")).unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.tempo_map, second.tempo_map);
    }

    #[test]
    fn unknown_algorithm_fails_before_any_audio_io() {
        let (context, source) = stub_context(None);
        let orchestrator = Orchestrator::new(context, config("madmom"));

        let err = orchestrator.run(Path::new("/music/a.wav")).unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedAlgorithm(_)));
        assert_eq!(source.call_count(), 0);
    }

    #[test]
    fn detector_failure_is_recorded_in_the_store() {
        let store = Arc::new(AnalysisStore::in_memory().unwrap());
        let (context, _) = stub_context(Some(store.clone()));
        let orchestrator = Orchestrator::new(context, config("failing"));

        let err = orchestrator.run(Path::new("/music/a.wav")).unwrap_err();
        assert!(matches!(err, AnalysisError::Detector { .. }));

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_analyses, 1);
        assert_eq!(stats.min_bpm, None);
    }

    #[test]
    fn successful_run_persists_analysis_and_beats() {
        let store = Arc::new(AnalysisStore::in_memory().unwrap());
        let (context, _) = stub_context(Some(store.clone()));
        let orchestrator = Orchestrator::new(context, config("stub"));

        let outcome = orchestrator.run(Path::new("/music/a.wav")).unwrap();
        let PersistStatus::Stored(id) = outcome.persisted else {
            panic!("expected a stored analysis, got {:?}", outcome.persisted);
        };
        assert_eq!(
            store.beats_for(id).unwrap().len(),
            outcome.tempo_map.beat_count()
        );
    }

    #[test]
    fn persistence_failure_degrades_without_losing_the_result() {
        let store = Arc::new(AnalysisStore::in_memory().unwrap());
        let (context, _) = stub_context(Some(store.clone()));
        let orchestrator = Orchestrator::new(context, config("stub"));

        // Break the schema under the store so the save itself fails.
        store.execute_raw("DROP TABLE beats").unwrap();

        let outcome = orchestrator.run(Path::new("/music/a.wav")).unwrap();
        assert!(matches!(outcome.persisted, PersistStatus::Failed(_)));
        assert!(outcome.tempo_map.beat_count() > 10);
    }

    #[test]
    fn export_writes_next_to_the_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (context, _) = stub_context(None);
        let orchestrator = Orchestrator::new(context, config("stub")).with_export(ExportTarget {
            format: ExportFormat::Json,
            dir: dir.path().to_path_buf(),
        });

        let outcome = orchestrator.run(Path::new("/music/a.wav")).unwrap();
        let ExportStatus::Written(out) = outcome.exported else {
            panic!("expected a written export, got {:?}", outcome.exported);
        };
        assert!(out.exists());
        assert_eq!(out.extension().unwrap(), "json");
    }
}
