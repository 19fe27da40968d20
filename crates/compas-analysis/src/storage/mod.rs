mod embedded;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use compas_core::{AudioMeta, Beat, TempoMap};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use thiserror::Error;
use tracing::{debug, info, trace};

use embedded::migrations::runner;

pub type AudioFileId = i64;
pub type AnalysisId = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration error: {0}")]
    Migration(#[from] refinery::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisStatus {
    Pending,
    Completed,
    Failed,
}

impl AnalysisStatus {
    fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Completed => "completed",
            AnalysisStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredAudioFile {
    pub id: AudioFileId,
    pub path: PathBuf,
    pub checksum: String,
    pub duration: f64,
    pub sample_rate: u32,
    pub channels: u32,
}

/// One analysis row with its audio file loaded eagerly: query results never
/// require a follow-up lookup per row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAnalysis {
    pub id: AnalysisId,
    pub algorithm: String,
    pub status: AnalysisStatus,
    pub average_bpm: Option<f64>,
    pub beat_count: u32,
    pub error: Option<String>,
    pub created_at: i64,
    pub file: StoredAudioFile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmStats {
    pub algorithm: String,
    pub count: u32,
    pub average_bpm: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub total_files: u32,
    pub total_analyses: u32,
    pub total_beats: u32,
    pub min_bpm: Option<f64>,
    pub max_bpm: Option<f64>,
    pub average_bpm: Option<f64>,
    pub total_duration: f64,
    pub by_algorithm: Vec<AlgorithmStats>,
}

/// SQLite-backed analysis store. One connection per batch run, internally
/// serialized; every save is a single transaction so concurrent readers
/// never observe a half-written analysis/beats pair.
#[derive(Debug)]
pub struct AnalysisStore {
    conn: Arc<Mutex<Connection>>,
    statements: AtomicUsize,
}

impl AnalysisStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening analysis database");
        let mut conn = Connection::open(path)?;
        Self::initialize_connection(&mut conn)?;
        Ok(AnalysisStore {
            conn: Arc::new(Mutex::new(conn)),
            statements: AtomicUsize::new(0),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        Self::initialize_connection(&mut conn)?;
        Ok(AnalysisStore {
            conn: Arc::new(Mutex::new(conn)),
            statements: AtomicUsize::new(0),
        })
    }

    fn initialize_connection(conn: &mut Connection) -> Result<(), StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;

        let report = runner().run(conn)?;
        for migration in report.applied_migrations() {
            trace!("applied migration: {:?}", migration);
        }
        Ok(())
    }

    /// SQL statements prepared so far. The query contract promises a bounded
    /// count per call, independent of result-set size; tests hold it to that.
    pub fn statement_count(&self) -> usize {
        self.statements.load(Ordering::Relaxed)
    }

    /// Stores a completed analysis with its beats and tempo segments in one
    /// transaction. Re-running the same file and algorithm inserts a new
    /// analysis row; the audio file row is reused by path.
    pub fn save(&self, meta: &AudioMeta, map: &TempoMap) -> Result<AnalysisId, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let file_id = queries::upsert_audio_file(&tx, meta, &self.statements)?;
        let analysis_id = queries::insert_completed_analysis(&tx, file_id, map, &self.statements)?;
        queries::insert_beats(&tx, analysis_id, map.beats(), &self.statements)?;
        queries::insert_segments(&tx, analysis_id, map.segments(), &self.statements)?;

        tx.commit()?;
        debug!(analysis_id, path = %meta.path.display(), "analysis stored");
        Ok(analysis_id)
    }

    /// Stores a failed analysis for a file whose identity is already known.
    pub fn record_failure(
        &self,
        meta: &AudioMeta,
        algorithm: &str,
        error: &str,
    ) -> Result<AnalysisId, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let file_id = queries::upsert_audio_file(&tx, meta, &self.statements)?;
        let analysis_id =
            queries::insert_failed_analysis(&tx, file_id, algorithm, error, &self.statements)?;

        tx.commit()?;
        debug!(analysis_id, path = %meta.path.display(), "analysis failure recorded");
        Ok(analysis_id)
    }

    /// Completed analyses with `min_bpm <= average_bpm <= max_bpm`, ordered
    /// by BPM, each carrying its audio file from a single JOIN.
    pub fn query_bpm_range(
        &self,
        min_bpm: f64,
        max_bpm: f64,
    ) -> Result<Vec<StoredAnalysis>, StoreError> {
        let conn = self.conn.lock().unwrap();
        queries::analyses_in_bpm_range(&conn, min_bpm, max_bpm, &self.statements)
    }

    pub fn beats_for(&self, analysis_id: AnalysisId) -> Result<Vec<Beat>, StoreError> {
        let conn = self.conn.lock().unwrap();
        queries::beats_for_analysis(&conn, analysis_id, &self.statements)
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock().unwrap();
        queries::store_stats(&conn, &self.statements)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(sql)?;
        Ok(())
    }
}

mod queries {
    use super::*;

    fn track(statements: &AtomicUsize) {
        statements.fetch_add(1, Ordering::Relaxed);
    }

    fn parse_status(value: &str, column: usize) -> rusqlite::Result<AnalysisStatus> {
        match value {
            "pending" => Ok(AnalysisStatus::Pending),
            "completed" => Ok(AnalysisStatus::Completed),
            "failed" => Ok(AnalysisStatus::Failed),
            other => Err(rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown analysis status '{other}'"),
                )),
            )),
        }
    }

    pub fn upsert_audio_file(
        tx: &Transaction,
        meta: &AudioMeta,
        statements: &AtomicUsize,
    ) -> rusqlite::Result<AudioFileId> {
        let path = meta.path.to_string_lossy();

        track(statements);
        if let Some(id) = tx
            .query_row("SELECT id FROM audio_files WHERE path = ?1", [path.as_ref()], |row| {
                row.get::<usize, AudioFileId>(0)
            })
            .optional()?
        {
            track(statements);
            tx.execute(
                "UPDATE audio_files
                    SET checksum = ?2, duration = ?3, sample_rate = ?4, channels = ?5
                  WHERE id = ?1",
                params![id, meta.checksum, meta.duration, meta.sample_rate, meta.channels],
            )?;
            return Ok(id);
        }

        track(statements);
        tx.execute(
            "INSERT INTO audio_files (path, checksum, duration, sample_rate, channels)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                path.as_ref(),
                meta.checksum,
                meta.duration,
                meta.sample_rate,
                meta.channels
            ],
        )?;
        Ok(tx.last_insert_rowid())
    }

    pub fn insert_completed_analysis(
        tx: &Transaction,
        file_id: AudioFileId,
        map: &TempoMap,
        statements: &AtomicUsize,
    ) -> rusqlite::Result<AnalysisId> {
        track(statements);
        tx.execute(
            "INSERT INTO analyses (audio_file_id, algorithm, status, average_bpm, beat_count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                file_id,
                map.algorithm(),
                AnalysisStatus::Completed.as_str(),
                map.average_bpm(),
                map.beat_count() as i64
            ],
        )?;
        Ok(tx.last_insert_rowid())
    }

    pub fn insert_failed_analysis(
        tx: &Transaction,
        file_id: AudioFileId,
        algorithm: &str,
        error: &str,
        statements: &AtomicUsize,
    ) -> rusqlite::Result<AnalysisId> {
        track(statements);
        tx.execute(
            "INSERT INTO analyses (audio_file_id, algorithm, status, error)
             VALUES (?1, ?2, ?3, ?4)",
            params![file_id, algorithm, AnalysisStatus::Failed.as_str(), error],
        )?;
        Ok(tx.last_insert_rowid())
    }

    pub fn insert_beats(
        tx: &Transaction,
        analysis_id: AnalysisId,
        beats: &[Beat],
        statements: &AtomicUsize,
    ) -> rusqlite::Result<()> {
        track(statements);
        let mut stmt = tx.prepare(
            "INSERT INTO beats (analysis_id, time, position, confidence, tempo_at_beat)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for beat in beats {
            stmt.execute(params![
                analysis_id,
                beat.time,
                beat.position,
                beat.confidence,
                beat.tempo_at_beat
            ])?;
        }
        Ok(())
    }

    pub fn insert_segments(
        tx: &Transaction,
        analysis_id: AnalysisId,
        segments: &[compas_core::TempoSegment],
        statements: &AtomicUsize,
    ) -> rusqlite::Result<()> {
        if segments.is_empty() {
            return Ok(());
        }
        track(statements);
        let mut stmt = tx.prepare(
            "INSERT INTO tempo_segments (analysis_id, start_time, end_time, bpm)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for segment in segments {
            stmt.execute(params![analysis_id, segment.start, segment.end, segment.bpm])?;
        }
        Ok(())
    }

    pub fn analyses_in_bpm_range(
        conn: &Connection,
        min_bpm: f64,
        max_bpm: f64,
        statements: &AtomicUsize,
    ) -> Result<Vec<StoredAnalysis>, StoreError> {
        track(statements);
        let mut stmt = conn.prepare(
            "SELECT a.id, a.algorithm, a.status, a.average_bpm, a.beat_count, a.error, a.created_at,
                    f.id, f.path, f.checksum, f.duration, f.sample_rate, f.channels
               FROM analyses a
               JOIN audio_files f ON f.id = a.audio_file_id
              WHERE a.average_bpm IS NOT NULL
                AND a.average_bpm >= ?1 AND a.average_bpm <= ?2
              ORDER BY a.average_bpm",
        )?;

        let rows = stmt.query_map(params![min_bpm, max_bpm], |row| {
            let status: String = row.get(2)?;
            Ok(StoredAnalysis {
                id: row.get(0)?,
                algorithm: row.get(1)?,
                status: parse_status(&status, 2)?,
                average_bpm: row.get(3)?,
                beat_count: row.get(4)?,
                error: row.get(5)?,
                created_at: row.get(6)?,
                file: StoredAudioFile {
                    id: row.get(7)?,
                    path: PathBuf::from(row.get::<usize, String>(8)?),
                    checksum: row.get(9)?,
                    duration: row.get(10)?,
                    sample_rate: row.get(11)?,
                    channels: row.get(12)?,
                },
            })
        })?;

        let mut analyses = Vec::new();
        for analysis in rows {
            analyses.push(analysis?);
        }
        Ok(analyses)
    }

    pub fn beats_for_analysis(
        conn: &Connection,
        analysis_id: AnalysisId,
        statements: &AtomicUsize,
    ) -> Result<Vec<Beat>, StoreError> {
        track(statements);
        let mut stmt = conn.prepare(
            "SELECT time, position, confidence, tempo_at_beat
               FROM beats
              WHERE analysis_id = ?1
              ORDER BY time",
        )?;

        let rows = stmt.query_map([analysis_id], |row| {
            Ok(Beat {
                time: row.get(0)?,
                position: row.get(1)?,
                confidence: row.get(2)?,
                tempo_at_beat: row.get(3)?,
            })
        })?;

        let mut beats = Vec::new();
        for beat in rows {
            beats.push(beat?);
        }
        Ok(beats)
    }

    pub fn store_stats(
        conn: &Connection,
        statements: &AtomicUsize,
    ) -> Result<StoreStats, StoreError> {
        track(statements);
        let mut stats = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM audio_files),
                    (SELECT COUNT(*) FROM analyses),
                    (SELECT COUNT(*) FROM beats),
                    (SELECT MIN(average_bpm) FROM analyses WHERE status = 'completed'),
                    (SELECT MAX(average_bpm) FROM analyses WHERE status = 'completed'),
                    (SELECT AVG(average_bpm) FROM analyses WHERE status = 'completed'),
                    (SELECT COALESCE(SUM(duration), 0.0) FROM audio_files)",
            [],
            |row| {
                Ok(StoreStats {
                    total_files: row.get(0)?,
                    total_analyses: row.get(1)?,
                    total_beats: row.get(2)?,
                    min_bpm: row.get(3)?,
                    max_bpm: row.get(4)?,
                    average_bpm: row.get(5)?,
                    total_duration: row.get(6)?,
                    by_algorithm: Vec::new(),
                })
            },
        )?;

        track(statements);
        let mut stmt = conn.prepare(
            "SELECT algorithm, COUNT(*), AVG(average_bpm)
               FROM analyses
              GROUP BY algorithm
              ORDER BY algorithm",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AlgorithmStats {
                algorithm: row.get(0)?,
                count: row.get(1)?,
                average_bpm: row.get(2)?,
            })
        })?;
        for row in rows {
            stats.by_algorithm.push(row?);
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::detect::Detector;
    use crate::testing::{StubDetector, click_audio};

    fn fixture(path: &str, bpm: f64) -> (AudioMeta, TempoMap) {
        let audio = click_audio(20.0, 120.0, 8000);
        let map = StubDetector.detect(&audio, &DetectorConfig::default()).unwrap();
        // Rebuild the map around the requested average BPM.
        let map = TempoMap::new(
            map.beats().to_vec(),
            bpm,
            "stub",
            map.duration(),
            map.beats_per_measure(),
            map.segments().to_vec(),
        )
        .unwrap();

        let mut meta = audio.meta;
        meta.path = PathBuf::from(path);
        meta.checksum = format!("checksum-{path}");
        (meta, map)
    }

    #[test]
    fn save_and_query_by_bpm_range() {
        let store = AnalysisStore::in_memory().unwrap();
        let (meta, map) = fixture("/music/track.wav", 117.5);
        store.save(&meta, &map).unwrap();

        let hits = store.query_bpm_range(100.0, 140.0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].average_bpm, Some(117.5));
        assert_eq!(hits[0].status, AnalysisStatus::Completed);
        assert_eq!(hits[0].file.path, PathBuf::from("/music/track.wav"));
        assert_eq!(hits[0].beat_count as usize, map.beat_count());

        assert!(store.query_bpm_range(120.0, 140.0).unwrap().is_empty());
    }

    #[test]
    fn rerun_inserts_a_new_analysis_row() {
        let store = AnalysisStore::in_memory().unwrap();
        let (meta, map) = fixture("/music/track.wav", 117.5);

        store.save(&meta, &map).unwrap();
        store.save(&meta, &map).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.total_analyses, 2);
    }

    #[test]
    fn beats_round_trip() {
        let store = AnalysisStore::in_memory().unwrap();
        let (meta, map) = fixture("/music/track.wav", 117.5);
        let id = store.save(&meta, &map).unwrap();

        let beats = store.beats_for(id).unwrap();
        assert_eq!(beats, map.beats());
    }

    #[test]
    fn failures_are_recorded_but_not_queryable_by_bpm() {
        let store = AnalysisStore::in_memory().unwrap();
        let (meta, _) = fixture("/music/broken.wav", 117.5);

        store.record_failure(&meta, "stub", "no stable tempo found").unwrap();

        assert!(store.query_bpm_range(0.0, 1000.0).unwrap().is_empty());
        let stats = store.stats().unwrap();
        assert_eq!(stats.total_analyses, 1);
        assert_eq!(stats.min_bpm, None);
    }

    #[test]
    fn stats_aggregate_across_algorithms() {
        let store = AnalysisStore::in_memory().unwrap();
        let (meta_a, map_a) = fixture("/music/a.wav", 100.0);
        store.save(&meta_a, &map_a).unwrap();

        let (meta_b, base) = fixture("/music/b.wav", 150.0);
        let map_b = TempoMap::new(
            base.beats().to_vec(),
            150.0,
            "grid",
            base.duration(),
            base.beats_per_measure(),
            vec![],
        )
        .unwrap();
        store.save(&meta_b, &map_b).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.min_bpm, Some(100.0));
        assert_eq!(stats.max_bpm, Some(150.0));
        assert_eq!(stats.average_bpm, Some(125.0));
        assert!(stats.total_duration > 0.0);
        assert_eq!(stats.by_algorithm.len(), 2);
        assert_eq!(stats.by_algorithm[0].algorithm, "grid");
    }

    #[test]
    fn range_query_issues_a_bounded_statement_count() {
        let store = AnalysisStore::in_memory().unwrap();
        for i in 0..30 {
            let (meta, map) = fixture(&format!("/music/track-{i}.wav"), 90.0 + i as f64);
            store.save(&meta, &map).unwrap();
        }

        let before = store.statement_count();
        let hits = store.query_bpm_range(0.0, 1000.0).unwrap();
        let after = store.statement_count();

        assert_eq!(hits.len(), 30);
        // Eager join: one statement no matter how many rows come back.
        assert_eq!(after - before, 1);
        for hit in &hits {
            assert!(hit.file.duration > 0.0);
        }
    }
}
