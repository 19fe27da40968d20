pub mod media;
pub mod tempo_map;

pub use media::AudioMeta;
pub use tempo_map::{Beat, TempoMap, TempoMapError, TempoSegment};
