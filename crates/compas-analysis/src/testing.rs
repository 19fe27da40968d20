//! Test fixtures shared across module tests: synthetic click tracks and
//! scripted collaborator stubs, so no real audio files are needed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use compas_core::{AudioMeta, Beat, TempoMap};
use sha2::{Digest, Sha256};
use symphonia::core::errors::Error as SymphoniaError;

use crate::audio::{AudioLoadError, AudioSource, LoadedAudio};
use crate::cache::TempoCache;
use crate::config::DetectorConfig;
use crate::context::AnalysisContext;
use crate::detect::{DetectError, Detector, DetectorRegistry};
use crate::storage::AnalysisStore;

/// Synthetic click track: short decaying bursts at the given tempo.
pub(crate) fn click_audio(secs: f64, bpm: f64, sample_rate: u32) -> LoadedAudio {
    let total = (secs * sample_rate as f64) as usize;
    let mut samples = vec![0.0f32; total];

    let interval = (60.0 / bpm * sample_rate as f64) as usize;
    let burst = 512.min(interval / 4);
    let mut start = 0;
    while start + burst < total {
        for i in 0..burst {
            samples[start + i] += 0.9 * (1.0 - i as f32 / burst as f32);
        }
        start += interval;
    }

    LoadedAudio {
        samples,
        meta: AudioMeta {
            path: PathBuf::from("synthetic.wav"),
            checksum: "synthetic".to_string(),
            duration: secs,
            sample_rate,
            channels: 1,
        },
    }
}

/// Loader stub: synthesizes deterministic audio per path and counts calls.
/// Paths containing "corrupt" fail the way a broken stream would.
pub(crate) struct StubSource {
    pub calls: AtomicUsize,
}

impl StubSource {
    pub(crate) fn new() -> Self {
        StubSource {
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl AudioSource for StubSource {
    fn load(&self, path: &Path) -> Result<LoadedAudio, AudioLoadError> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        if path.to_string_lossy().contains("corrupt") {
            return Err(AudioLoadError::Corrupt {
                path: path.to_path_buf(),
                source: SymphoniaError::DecodeError("synthetic corruption"),
            });
        }

        let mut audio = click_audio(20.0, 120.0, 8000);
        audio.meta.path = path.to_path_buf();
        // Content stands in for itself: same path, same bytes, same checksum.
        audio.meta.checksum = hex::encode(Sha256::digest(path.to_string_lossy().as_bytes()));
        Ok(audio)
    }
}

/// Detector stub returning a fixed, deterministic map for any input.
#[derive(Debug)]
pub(crate) struct StubDetector;

impl Detector for StubDetector {
    fn id(&self) -> &'static str {
        "stub"
    }

    fn detect(&self, audio: &LoadedAudio, config: &DetectorConfig) -> Result<TempoMap, DetectError> {
        let interval = 0.5;
        let mut beats = Vec::new();
        let mut index = 0u32;
        loop {
            let time = 0.5 + f64::from(index) * interval;
            if time >= audio.meta.duration {
                break;
            }
            beats.push(Beat {
                time,
                position: (index % config.beats_per_measure) + 1,
                confidence: 0.9,
                tempo_at_beat: 120.0,
            });
            index += 1;
        }
        Ok(TempoMap::new(
            beats,
            120.0,
            self.id(),
            audio.meta.duration,
            config.beats_per_measure,
            vec![],
        )?)
    }
}

/// Detector stub that always fails, for failure-isolation tests.
#[derive(Debug)]
pub(crate) struct FailingDetector;

impl Detector for FailingDetector {
    fn id(&self) -> &'static str {
        "failing"
    }

    fn detect(&self, _: &LoadedAudio, _: &DetectorConfig) -> Result<TempoMap, DetectError> {
        Err(DetectError::NoTempo)
    }
}

/// Detector stub that blocks before answering, for timeout tests.
#[derive(Debug)]
pub(crate) struct SlowDetector(pub Duration);

impl Detector for SlowDetector {
    fn id(&self) -> &'static str {
        "slow"
    }

    fn detect(&self, audio: &LoadedAudio, config: &DetectorConfig) -> Result<TempoMap, DetectError> {
        std::thread::sleep(self.0);
        StubDetector.detect(audio, config)
    }
}

/// Context wired entirely from stubs, with every stub detector registered.
pub(crate) fn stub_context(store: Option<Arc<AnalysisStore>>) -> (Arc<AnalysisContext>, Arc<StubSource>) {
    let mut registry = DetectorRegistry::empty();
    registry.register(Arc::new(StubDetector));
    registry.register(Arc::new(FailingDetector));
    registry.register(Arc::new(SlowDetector(Duration::from_millis(200))));

    let source = Arc::new(StubSource::new());
    let context = AnalysisContext {
        registry: Arc::new(registry),
        source: source.clone(),
        cache: Arc::new(TempoCache::in_memory()),
        store,
    };
    (Arc::new(context), source)
}
