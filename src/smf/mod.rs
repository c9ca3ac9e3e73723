mod decoder;
mod loader;
mod reader;
mod tempo;

pub use decoder::{SkipTable, TrackDecoder, TrackParseResult, decode_track};
pub use loader::{
    Header, LoadOptions, LoadProgress, Timeline, TrackChunk, TrackProgress, index_tracks,
    load_bytes, load_file,
};
pub use reader::{EndOfChunk, MAX_VLQ_BYTES, TrackReader};
pub use tempo::TempoMap;
