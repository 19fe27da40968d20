use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use compas_core::{AudioMeta, TempoMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to serialize export payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Output schemas. Each is a pure projection of (AudioMeta, TempoMap): no
/// format carries information the tempo map lacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Jams,
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Jams => "jams",
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

pub fn render(
    format: ExportFormat,
    meta: &AudioMeta,
    map: &TempoMap,
) -> Result<String, ExportError> {
    match format {
        ExportFormat::Jams => render_jams(meta, map),
        ExportFormat::Csv => Ok(render_csv(map)),
        ExportFormat::Json => render_json(meta, map),
    }
}

/// Renders next to the source file's stem inside `dir`.
pub fn write_to_dir(
    format: ExportFormat,
    dir: &Path,
    meta: &AudioMeta,
    map: &TempoMap,
) -> Result<PathBuf, ExportError> {
    let rendered = render(format, meta, map)?;

    let stem = meta
        .path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "analysis".to_string());
    let out = dir.join(format!("{stem}.{}", format.extension()));

    std::fs::create_dir_all(dir).map_err(|source| ExportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    std::fs::write(&out, rendered).map_err(|source| ExportError::Io {
        path: out.clone(),
        source,
    })?;
    Ok(out)
}

/// JAMS-style annotation document: beats as zero-duration events, tempo as
/// one observation per segment (or a single whole-file observation).
fn render_jams(meta: &AudioMeta, map: &TempoMap) -> Result<String, ExportError> {
    let beat_data: Vec<serde_json::Value> = map
        .beats()
        .iter()
        .map(|beat| {
            json!({
                "time": beat.time,
                "duration": 0.0,
                "value": beat.position,
                "confidence": beat.confidence,
            })
        })
        .collect();

    let tempo_data: Vec<serde_json::Value> = if map.segments().is_empty() {
        vec![json!({
            "time": 0.0,
            "duration": map.duration(),
            "value": map.average_bpm(),
            "confidence": 1.0,
        })]
    } else {
        map.segments()
            .iter()
            .map(|segment| {
                json!({
                    "time": segment.start,
                    "duration": segment.end - segment.start,
                    "value": segment.bpm,
                    "confidence": 1.0,
                })
            })
            .collect()
    };

    let document = json!({
        "file_metadata": {
            "identifiers": { "file": meta.path.to_string_lossy() },
            "duration": map.duration(),
        },
        "annotations": [
            {
                "namespace": "beat",
                "annotation_metadata": { "data_source": map.algorithm() },
                "data": beat_data,
            },
            {
                "namespace": "tempo",
                "annotation_metadata": { "data_source": map.algorithm() },
                "data": tempo_data,
            },
        ],
    });

    Ok(serde_json::to_string_pretty(&document)?)
}

/// `time,position,confidence,bpm` rows; the bpm column is the instantaneous
/// tempo from the preceding interval, seeded with the average on row one.
fn render_csv(map: &TempoMap) -> String {
    let mut out = String::from("time,position,confidence,bpm\n");
    let mut prev_time: Option<f64> = None;
    for beat in map.beats() {
        let bpm = match prev_time {
            Some(prev) => 60.0 / (beat.time - prev),
            None => map.average_bpm(),
        };
        let _ = writeln!(out, "{},{},{},{}", beat.time, beat.position, beat.confidence, bpm);
        prev_time = Some(beat.time);
    }
    out
}

fn render_json(meta: &AudioMeta, map: &TempoMap) -> Result<String, ExportError> {
    let document = json!({
        "file": meta.path.to_string_lossy(),
        "checksum": meta.checksum,
        "duration": map.duration(),
        "sample_rate": meta.sample_rate,
        "channels": meta.channels,
        "algorithm": map.algorithm(),
        "average_bpm": map.average_bpm(),
        "beats": serde_json::to_value(map.beats())?,
        "segments": serde_json::to_value(map.segments())?,
    });
    Ok(serde_json::to_string_pretty(&document)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::detect::Detector;
    use crate::testing::{StubDetector, click_audio};

    fn fixture() -> (AudioMeta, TempoMap) {
        let audio = click_audio(10.0, 120.0, 8000);
        let map = StubDetector.detect(&audio, &DetectorConfig::default()).unwrap();
        (audio.meta, map)
    }

    #[test]
    fn csv_has_header_and_one_row_per_beat() {
        let (_, map) = fixture();
        let csv = render_csv(&map);

        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "time,position,confidence,bpm");
        assert_eq!(lines.len(), map.beat_count() + 1);

        // First row carries the average, later rows the interval tempo.
        assert!(lines[1].ends_with("120"));
        assert!(lines[2].ends_with("120"));
    }

    #[test]
    fn jams_beats_are_zero_duration_events() {
        let (meta, map) = fixture();
        let rendered = render(ExportFormat::Jams, &meta, &map).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&rendered).unwrap();

        let annotations = doc["annotations"].as_array().unwrap();
        assert_eq!(annotations[0]["namespace"], "beat");
        assert_eq!(annotations[1]["namespace"], "tempo");

        let beats = annotations[0]["data"].as_array().unwrap();
        assert_eq!(beats.len(), map.beat_count());
        assert_eq!(beats[0]["duration"], 0.0);
        assert_eq!(beats[0]["value"], 1);

        let tempo = annotations[1]["data"].as_array().unwrap();
        assert_eq!(tempo.len(), 1);
        assert!(tempo[0]["duration"].as_f64().unwrap() > 0.0);
        assert_eq!(tempo[0]["value"], 120.0);
    }

    #[test]
    fn json_document_carries_metadata_and_beats() {
        let (meta, map) = fixture();
        let rendered = render(ExportFormat::Json, &meta, &map).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&rendered).unwrap();

        assert_eq!(doc["algorithm"], "stub");
        assert_eq!(doc["average_bpm"], 120.0);
        assert_eq!(doc["sample_rate"], 8000);
        assert_eq!(doc["beats"].as_array().unwrap().len(), map.beat_count());
    }

    #[test]
    fn write_to_dir_names_after_the_source_stem() {
        let dir = tempfile::tempdir().unwrap();
        let (mut meta, map) = fixture();
        meta.path = PathBuf::from("/music/My Track.wav");

        let out = write_to_dir(ExportFormat::Csv, dir.path(), &meta, &map).unwrap();
        assert_eq!(out.file_name().unwrap(), "My Track.csv");
        assert!(out.exists());
    }
}
