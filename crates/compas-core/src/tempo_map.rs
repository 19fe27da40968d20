use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BEATS_PER_MEASURE: u32 = 4;

#[derive(Debug, Error, PartialEq)]
pub enum TempoMapError {
    #[error("a tempo map must contain at least one beat")]
    NoBeats,

    #[error("beat {index} has a non-finite or negative time: {time}")]
    InvalidTime { index: usize, time: f64 },

    #[error("beat {index} at {time}s is not strictly after the previous beat at {prev}s")]
    OutOfOrder { index: usize, prev: f64, time: f64 },

    #[error("beat {index} has confidence {confidence}, expected a value in [0, 1]")]
    ConfidenceRange { index: usize, confidence: f64 },

    #[error("beat {index} has position {position}, expected a value in [1, {beats_per_measure}]")]
    PositionRange {
        index: usize,
        position: u32,
        beats_per_measure: u32,
    },

    #[error("beat {index} has non-positive tempo {tempo} BPM")]
    BeatTempo { index: usize, tempo: f64 },

    #[error("average BPM must be positive, got {bpm}")]
    AverageBpm { bpm: f64 },

    #[error("beats_per_measure must be at least 1")]
    BeatsPerMeasure,

    #[error("duration {duration}s does not cover the last beat at {last_beat}s")]
    DurationTooShort { duration: f64, last_beat: f64 },

    #[error("tempo segment {index} has invalid bounds")]
    SegmentBounds { index: usize },

    #[error("tempo segment {index} overlaps the previous segment")]
    SegmentOverlap { index: usize },

    #[error("tempo segment {index} has non-positive tempo {bpm} BPM")]
    SegmentBpm { index: usize, bpm: f64 },
}

/// Single timestamped rhythmic event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beat {
    /// Time in seconds from the start of the file.
    pub time: f64,
    /// 1-based metrical position, cycling within the measure.
    pub position: u32,
    /// Detector-reported confidence in [0, 1]. Used as-is, never rescaled.
    pub confidence: f64,
    /// Instantaneous BPM estimate at this beat.
    pub tempo_at_beat: f64,
}

/// Tempo over a half-open stretch of the file, for tempo-change maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoSegment {
    pub start: f64,
    pub end: f64,
    pub bpm: f64,
}

/// Full beat/tempo description of one analyzed file, for one algorithm run.
///
/// Immutable once constructed; every fix-up (`filter_by_confidence`) builds a
/// new instance through the validating constructor. Equality is structural,
/// so a map survives a serialize/deserialize round trip unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempoMap {
    beats: Vec<Beat>,
    average_bpm: f64,
    algorithm: String,
    duration: f64,
    beats_per_measure: u32,
    #[serde(default)]
    segments: Vec<TempoSegment>,
}

impl TempoMap {
    pub fn new(
        beats: Vec<Beat>,
        average_bpm: f64,
        algorithm: impl Into<String>,
        duration: f64,
        beats_per_measure: u32,
        segments: Vec<TempoSegment>,
    ) -> Result<Self, TempoMapError> {
        let map = TempoMap {
            beats,
            average_bpm,
            algorithm: algorithm.into(),
            duration,
            beats_per_measure,
            segments,
        };
        map.validate()?;
        Ok(map)
    }

    /// Re-checks every construction invariant.
    ///
    /// Deserialization does not go through `new`, so anything reading maps
    /// back from disk must call this before trusting the data.
    pub fn validate(&self) -> Result<(), TempoMapError> {
        if self.beats.is_empty() {
            return Err(TempoMapError::NoBeats);
        }
        if self.beats_per_measure == 0 {
            return Err(TempoMapError::BeatsPerMeasure);
        }
        if !self.average_bpm.is_finite() || self.average_bpm <= 0.0 {
            return Err(TempoMapError::AverageBpm { bpm: self.average_bpm });
        }

        let mut prev: Option<f64> = None;
        for (index, beat) in self.beats.iter().enumerate() {
            if !beat.time.is_finite() || beat.time < 0.0 {
                return Err(TempoMapError::InvalidTime {
                    index,
                    time: beat.time,
                });
            }
            if let Some(prev) = prev {
                if beat.time <= prev {
                    return Err(TempoMapError::OutOfOrder {
                        index,
                        prev,
                        time: beat.time,
                    });
                }
            }
            if !beat.confidence.is_finite() || !(0.0..=1.0).contains(&beat.confidence) {
                return Err(TempoMapError::ConfidenceRange {
                    index,
                    confidence: beat.confidence,
                });
            }
            if beat.position < 1 || beat.position > self.beats_per_measure {
                return Err(TempoMapError::PositionRange {
                    index,
                    position: beat.position,
                    beats_per_measure: self.beats_per_measure,
                });
            }
            if !beat.tempo_at_beat.is_finite() || beat.tempo_at_beat <= 0.0 {
                return Err(TempoMapError::BeatTempo {
                    index,
                    tempo: beat.tempo_at_beat,
                });
            }
            prev = Some(beat.time);
        }

        let last_beat = self.beats[self.beats.len() - 1].time;
        if !self.duration.is_finite() || self.duration < last_beat {
            return Err(TempoMapError::DurationTooShort {
                duration: self.duration,
                last_beat,
            });
        }

        let mut prev_end: Option<f64> = None;
        for (index, seg) in self.segments.iter().enumerate() {
            if !seg.start.is_finite() || !seg.end.is_finite() || seg.start < 0.0 || seg.end <= seg.start {
                return Err(TempoMapError::SegmentBounds { index });
            }
            if !seg.bpm.is_finite() || seg.bpm <= 0.0 {
                return Err(TempoMapError::SegmentBpm { index, bpm: seg.bpm });
            }
            if let Some(prev_end) = prev_end {
                if seg.start < prev_end {
                    return Err(TempoMapError::SegmentOverlap { index });
                }
            }
            prev_end = Some(seg.end);
        }

        Ok(())
    }

    pub fn beats(&self) -> &[Beat] {
        &self.beats
    }

    pub fn beat_count(&self) -> usize {
        self.beats.len()
    }

    pub fn average_bpm(&self) -> f64 {
        self.average_bpm
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn beats_per_measure(&self) -> u32 {
        self.beats_per_measure
    }

    pub fn segments(&self) -> &[TempoSegment] {
        &self.segments
    }

    /// Intervals between consecutive beats, in seconds.
    pub fn beat_intervals(&self) -> impl Iterator<Item = f64> + '_ {
        self.beats.windows(2).map(|pair| pair[1].time - pair[0].time)
    }

    /// Tempo measured from the inter-beat intervals, independent of whatever
    /// `average_bpm` the detector reported. `None` with fewer than two beats.
    pub fn median_tempo(&self) -> Option<f64> {
        let mut intervals: Vec<f64> = self.beat_intervals().collect();
        if intervals.is_empty() {
            return None;
        }
        intervals.sort_by(|a, b| a.total_cmp(b));
        let mid = intervals.len() / 2;
        let median = if intervals.len() % 2 == 0 {
            (intervals[mid - 1] + intervals[mid]) / 2.0
        } else {
            intervals[mid]
        };
        Some(60.0 / median)
    }

    /// Beats with `start <= time <= end`, as a lazy, restartable iterator.
    pub fn beats_between(&self, start: f64, end: f64) -> impl Iterator<Item = &Beat> + '_ {
        let from = self.beats.partition_point(|b| b.time < start);
        self.beats[from..].iter().take_while(move |b| b.time <= end)
    }

    /// New map keeping only beats with `confidence >= min_confidence`,
    /// recomputing the average BPM from the surviving intervals.
    pub fn filter_by_confidence(&self, min_confidence: f64) -> Result<TempoMap, TempoMapError> {
        let beats: Vec<Beat> = self
            .beats
            .iter()
            .filter(|b| b.confidence >= min_confidence)
            .cloned()
            .collect();
        if beats.is_empty() {
            return Err(TempoMapError::NoBeats);
        }

        let average_bpm = if beats.len() > 1 {
            let bpm_sum: f64 = beats
                .windows(2)
                .map(|pair| 60.0 / (pair[1].time - pair[0].time))
                .sum();
            bpm_sum / (beats.len() - 1) as f64
        } else {
            self.average_bpm
        };

        TempoMap::new(
            beats,
            average_bpm,
            self.algorithm.clone(),
            self.duration,
            self.beats_per_measure,
            self.segments.clone(),
        )
    }
}
