use std::path::PathBuf;

use thiserror::Error;

/// Fatal failures while loading a Standard MIDI File. No partial timeline is
/// produced when any of these is returned.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file is shorter than a MIDI header")]
    TruncatedHeader,
    #[error("missing MThd header magic")]
    BadMagic,
    #[error("header chunk declares size {0}, expected 6")]
    HeaderSize(u32),
    #[error("MIDI format {0} is not supported")]
    UnsupportedFormat(u16),
    #[error("negative time division {0} (SMPTE timing is not supported)")]
    NegativeDivision(i16),
    #[error("failed to spawn track decoder: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("no output device matches '{0}'")]
    DeviceNotFound(String),
    #[error("midi output error: {0}")]
    Midi(String),
    #[error("audio output error: {0}")]
    Audio(String),
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] ron::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no file is loaded")]
    NoTimeline,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[source] std::io::Error),
}
