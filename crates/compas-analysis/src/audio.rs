use std::fs::File;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use thiserror::Error;
use tracing::{debug, warn};

use compas_core::AudioMeta;

#[derive(Debug, Error)]
pub enum AudioLoadError {
    #[error("failed to open {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to probe the format of {path}")]
    Probe {
        path: PathBuf,
        #[source]
        source: SymphoniaError,
    },

    #[error("no decodable audio track in {path}")]
    NoTrack { path: PathBuf },

    #[error("the audio track in {path} has no sample rate")]
    NoSampleRate { path: PathBuf },

    #[error("failed to create a decoder for {path}")]
    CreateDecoder {
        path: PathBuf,
        #[source]
        source: SymphoniaError,
    },

    #[error("corrupt audio stream in {path}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: SymphoniaError,
    },

    #[error("{path} decoded to zero audio samples")]
    Empty { path: PathBuf },
}

/// Decoded audio handed to detectors: mono samples plus the identity record.
#[derive(Debug, Clone)]
pub struct LoadedAudio {
    pub samples: Vec<f32>,
    pub meta: AudioMeta,
}

/// Loader contract: path in, decoded mono audio and identity out.
///
/// The checksum in the returned `AudioMeta` must be derived from the raw file
/// content so identical sources hash identically regardless of path.
pub trait AudioSource: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedAudio, AudioLoadError>;
}

/// Default loader backed by symphonia's format probe and codecs.
pub struct SymphoniaSource;

impl AudioSource for SymphoniaSource {
    fn load(&self, path: &Path) -> Result<LoadedAudio, AudioLoadError> {
        let checksum = file_checksum(path)?;

        let file = File::open(path).map_err(|source| AudioLoadError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|source| AudioLoadError::Probe {
                path: path.to_path_buf(),
                source,
            })?;
        let mut format = probed.format;

        let track = format.default_track().ok_or_else(|| AudioLoadError::NoTrack {
            path: path.to_path_buf(),
        })?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params.sample_rate.ok_or_else(|| AudioLoadError::NoSampleRate {
            path: path.to_path_buf(),
        })?;
        let channels = params.channels.map(|c| c.count() as u32).unwrap_or(1);

        let mut decoder = get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|source| AudioLoadError::CreateDecoder {
                path: path.to_path_buf(),
                source,
            })?;

        let mut samples: Vec<f32> = Vec::new();
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(source) => {
                    // A stream that dies before yielding anything is corrupt;
                    // trailing read errors after good audio are tolerated.
                    if samples.is_empty() {
                        return Err(AudioLoadError::Corrupt {
                            path: path.to_path_buf(),
                            source,
                        });
                    }
                    warn!(path = %path.display(), error = %source, "stopping decode on packet error");
                    break;
                }
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    debug!(path = %path.display(), error = e, "skipping undecodable packet");
                    continue;
                }
                Err(source) => {
                    if samples.is_empty() {
                        return Err(AudioLoadError::Corrupt {
                            path: path.to_path_buf(),
                            source,
                        });
                    }
                    break;
                }
            };

            if sample_buf.is_none() {
                let spec = *decoded.spec();
                sample_buf = Some(SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
            }
            let buf = sample_buf.as_mut().unwrap();
            buf.copy_interleaved_ref(decoded);

            let interleaved = buf.samples();
            if channels > 1 {
                for frame in interleaved.chunks(channels as usize) {
                    samples.push(frame.iter().sum::<f32>() / channels as f32);
                }
            } else {
                samples.extend_from_slice(interleaved);
            }
        }

        if samples.is_empty() {
            return Err(AudioLoadError::Empty {
                path: path.to_path_buf(),
            });
        }

        let duration = samples.len() as f64 / sample_rate as f64;
        debug!(
            path = %path.display(),
            duration,
            sample_rate,
            channels,
            "decoded audio"
        );

        Ok(LoadedAudio {
            samples,
            meta: AudioMeta {
                path: path.to_path_buf(),
                checksum,
                duration,
                sample_rate,
                channels,
            },
        })
    }
}

/// SHA-256 over the raw file bytes, streamed so large files stay cheap.
fn file_checksum(path: &Path) -> Result<String, AudioLoadError> {
    let mut file = File::open(path).map_err(|source| AudioLoadError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|source| AudioLoadError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(hasher.finalize()))
}
