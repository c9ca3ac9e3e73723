//! Standard MIDI File loading and real-time playback.
//!
//! Files are decoded track-by-track in parallel and merged into a single
//! tick-ordered [`Timeline`]. A scheduler thread walks the timeline against a
//! tempo-aware clock and hands due messages to a dispatch thread through a
//! lock-free ring; the dispatch thread forwards them to a [`Backend`].

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod smf;
pub mod telemetry;
pub mod timing;

#[cfg(test)]
mod testutil;

pub use backend::{Backend, BackendKind, DeviceDescriptor};
pub use config::PlayerConfig;
pub use engine::{EngineCommand, EngineHandle, EngineUpdate, spawn_engine, spawn_engine_with};
pub use error::{BackendError, ConfigError, EngineError, LoadError};
pub use events::{Event, TempoChange};
pub use smf::{LoadOptions, LoadProgress, Timeline, load_bytes, load_file};
pub use telemetry::{PlayerState, Telemetry, TelemetrySnapshot};
