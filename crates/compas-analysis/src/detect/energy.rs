use compas_core::{Beat, TempoMap};
use rustfft::{FftPlanner, num_complex::Complex};
use tracing::debug;

use crate::audio::LoadedAudio;
use crate::config::DetectorConfig;

use super::{DetectError, Detector, fold_into_range};

const MIN_DURATION_SECS: f64 = 3.0;

/// Spectral-flux onset detector.
///
/// Frames the signal with a Hann window, takes the positive magnitude
/// difference between consecutive spectra, and picks peaks of that envelope
/// as beats. Per-beat confidence is the peak's share of the strongest flux in
/// the file, so softer onsets rank lower.
#[derive(Debug)]
pub struct EnergyDetector;

impl Detector for EnergyDetector {
    fn id(&self) -> &'static str {
        "energy"
    }

    fn detect(&self, audio: &LoadedAudio, config: &DetectorConfig) -> Result<TempoMap, DetectError> {
        let window = config.window_size;
        let hop = config.hop_size;
        let sample_rate = audio.meta.sample_rate as f64;

        if audio.meta.duration < MIN_DURATION_SECS || audio.samples.len() < window * 4 {
            return Err(DetectError::TooShort {
                seconds: audio.meta.duration,
            });
        }

        let flux = spectral_flux(&audio.samples, window, hop);
        let envelope = smooth(&flux);

        let frame_dt = hop as f64 / sample_rate;
        let min_separation = ((60.0 / config.tempo_range.1) / frame_dt).round().max(1.0) as usize;
        let peaks = pick_peaks(&envelope, min_separation);
        if peaks.len() < 2 {
            return Err(DetectError::NoTempo);
        }

        let onset_times: Vec<f64> = peaks.iter().map(|&i| i as f64 * frame_dt).collect();
        let mut intervals: Vec<f64> = onset_times.windows(2).map(|w| w[1] - w[0]).collect();
        intervals.sort_by(|a, b| a.total_cmp(b));
        let median_interval = intervals[intervals.len() / 2];
        let average_bpm = fold_into_range(60.0 / median_interval, config.tempo_range);

        let max_peak = peaks
            .iter()
            .map(|&i| envelope[i])
            .fold(f32::EPSILON, f32::max);

        let beats: Vec<Beat> = peaks
            .iter()
            .enumerate()
            .map(|(k, &frame)| {
                let tempo_at_beat = if k == 0 {
                    average_bpm
                } else {
                    let local = onset_times[k] - onset_times[k - 1];
                    fold_into_range(60.0 / local, config.tempo_range)
                };
                Beat {
                    time: onset_times[k],
                    position: (k as u32 % config.beats_per_measure) + 1,
                    confidence: f64::from((envelope[frame] / max_peak).clamp(0.1, 1.0)),
                    tempo_at_beat,
                }
            })
            .collect();

        debug!(
            beats = beats.len(),
            average_bpm,
            "spectral-flux detection complete"
        );

        Ok(TempoMap::new(
            beats,
            average_bpm,
            self.id(),
            audio.meta.duration,
            config.beats_per_measure,
            vec![],
        )?)
    }
}

/// Positive magnitude difference between consecutive Hann-windowed spectra.
fn spectral_flux(samples: &[f32], window: usize, hop: usize) -> Vec<f32> {
    let hann: Vec<f32> = apodize::hanning_iter(window).map(|v| v as f32).collect();
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(window);

    let mut buffer: Vec<Complex<f32>> = vec![Complex::default(); window];
    let mut prev_mags = vec![0.0f32; window / 2];
    let mut flux = Vec::with_capacity(samples.len() / hop);

    let mut start = 0;
    while start + window <= samples.len() {
        for (i, slot) in buffer.iter_mut().enumerate() {
            *slot = Complex {
                re: samples[start + i] * hann[i],
                im: 0.0,
            };
        }
        fft.process(&mut buffer);

        let mut frame_flux = 0.0f32;
        for (i, bin) in buffer[..window / 2].iter().enumerate() {
            let mag = bin.norm();
            let diff = mag - prev_mags[i];
            if diff > 0.0 {
                frame_flux += diff;
            }
            prev_mags[i] = mag;
        }
        flux.push(frame_flux);

        start += hop;
    }

    // The first frame's flux is the full spectrum appearing out of silence.
    if let Some(first) = flux.first_mut() {
        *first = 0.0;
    }
    flux
}

/// 3-point moving average.
fn smooth(flux: &[f32]) -> Vec<f32> {
    flux.iter()
        .enumerate()
        .map(|(i, &v)| {
            let prev = if i > 0 { flux[i - 1] } else { v };
            let next = if i + 1 < flux.len() { flux[i + 1] } else { v };
            (prev + v + next) / 3.0
        })
        .collect()
}

/// Local maxima above an adaptive threshold, at least `min_separation`
/// frames apart.
fn pick_peaks(envelope: &[f32], min_separation: usize) -> Vec<usize> {
    if envelope.len() < 3 {
        return Vec::new();
    }

    let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
    let variance = envelope.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / envelope.len() as f32;
    let threshold = mean + variance.sqrt();

    let mut peaks: Vec<usize> = Vec::new();
    for i in 1..envelope.len() - 1 {
        if envelope[i] < threshold {
            continue;
        }
        if envelope[i] <= envelope[i - 1] || envelope[i] < envelope[i + 1] {
            continue;
        }
        if let Some(&last) = peaks.last() {
            if i - last < min_separation {
                continue;
            }
        }
        peaks.push(i);
    }
    peaks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::click_audio;

    #[test]
    fn finds_beats_in_a_click_track() {
        let audio = click_audio(30.0, 120.0, 22050);
        let config = DetectorConfig::default();

        let map = EnergyDetector.detect(&audio, &config).unwrap();

        assert!((40..=70).contains(&map.beat_count()), "got {}", map.beat_count());
        assert!(
            (100.0..=140.0).contains(&map.average_bpm()),
            "got {}",
            map.average_bpm()
        );
        assert!(map.beats().iter().all(|b| (0.1..=1.0).contains(&b.confidence)));
        assert!(map.beats().last().unwrap().time < map.duration());
    }

    #[test]
    fn rejects_short_audio() {
        let audio = click_audio(1.0, 120.0, 22050);
        let err = EnergyDetector.detect(&audio, &DetectorConfig::default()).unwrap_err();
        assert!(matches!(err, DetectError::TooShort { .. }));
    }
}
