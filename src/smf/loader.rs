use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::decoder::{TrackParseResult, decode_track};
use super::reader::TrackReader;
use super::tempo::TempoMap;
use crate::error::LoadError;
use crate::events::{Event, TempoChange};

pub const HEADER_LEN: u64 = 14;
const CHUNK_HEADER_LEN: u64 = 8;
const DECODE_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub format: u16,
    pub declared_tracks: u16,
    pub ppq: u16,
}

impl Header {
    pub fn parse(bytes: &[u8; HEADER_LEN as usize]) -> Result<Self, LoadError> {
        if &bytes[0..4] != b"MThd" {
            return Err(LoadError::BadMagic);
        }
        let size = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if size != 6 {
            return Err(LoadError::HeaderSize(size));
        }
        let format = u16::from_be_bytes([bytes[8], bytes[9]]);
        if format == 2 {
            return Err(LoadError::UnsupportedFormat(format));
        }
        let declared_tracks = u16::from_be_bytes([bytes[10], bytes[11]]);
        let division = i16::from_be_bytes([bytes[12], bytes[13]]);
        if division < 0 {
            return Err(LoadError::NegativeDivision(division));
        }

        Ok(Self {
            format,
            declared_tracks,
            ppq: division as u16,
        })
    }
}

/// Location of one `MTrk` payload inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackChunk {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Note-ons quieter than this are dropped together with their note-off.
    pub velocity_threshold: u8,
    /// Tracks past this index are indexed but never decoded.
    pub track_limit: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            velocity_threshold: 0,
            track_limit: usize::MAX,
        }
    }
}

#[derive(Debug)]
pub struct TrackProgress {
    pub length: u64,
    consumed: AtomicU64,
    finished: AtomicBool,
}

impl TrackProgress {
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn fraction(&self) -> f64 {
        if self.is_finished() || self.length == 0 {
            return 1.0;
        }
        (self.consumed() as f64 / self.length as f64).min(1.0)
    }
}

/// Load-phase counters, safe to poll from another thread while a load runs.
/// Nothing here is touched once playback starts.
#[derive(Debug, Default)]
pub struct LoadProgress {
    tracks: RwLock<Vec<Arc<TrackProgress>>>,
    notes_total: AtomicU64,
    notes_loaded: AtomicU64,
    events: AtomicU64,
}

impl LoadProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tracks(&self) -> Vec<Arc<TrackProgress>> {
        self.tracks.read().clone()
    }

    pub fn notes_total(&self) -> u64 {
        self.notes_total.load(Ordering::Relaxed)
    }

    pub fn notes_loaded(&self) -> u64 {
        self.notes_loaded.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    fn reset(&self, chunks: &[TrackChunk]) {
        *self.tracks.write() = chunks
            .iter()
            .map(|chunk| {
                Arc::new(TrackProgress {
                    length: chunk.len,
                    consumed: AtomicU64::new(0),
                    finished: AtomicBool::new(false),
                })
            })
            .collect();
        self.notes_total.store(0, Ordering::Relaxed);
        self.notes_loaded.store(0, Ordering::Relaxed);
        self.events.store(0, Ordering::Relaxed);
    }

    fn record(&self, result: &TrackParseResult) {
        self.notes_total
            .fetch_add(result.notes_total, Ordering::Relaxed);
        self.notes_loaded
            .fetch_add(result.notes_loaded, Ordering::Relaxed);
        self.events
            .fetch_add(result.events.len() as u64, Ordering::Relaxed);
    }
}

/// The merged, tick-ordered result of a load. Read-only once built.
#[derive(Debug, Clone)]
pub struct Timeline {
    pub header: Header,
    pub events: Vec<Event>,
    pub tempo: TempoMap,
    pub tracks_indexed: usize,
    pub tracks_decoded: usize,
    pub max_tick: u32,
    pub notes_total: u64,
    pub notes_loaded: u64,
}

impl Timeline {
    pub fn ppq(&self) -> u16 {
        self.header.ppq
    }

    pub fn duration_seconds(&self) -> f64 {
        self.tempo.ticks_to_seconds(self.max_tick, self.header.ppq)
    }
}

pub fn load_file(
    path: &Path,
    options: &LoadOptions,
    progress: &LoadProgress,
) -> Result<Timeline, LoadError> {
    let io_err = |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_err)?;
    let file_len = file.metadata().map_err(io_err)?.len();
    let mut reader = BufReader::new(file);
    let header = read_header(&mut reader).map_err(|e| match e {
        HeaderReadError::Format(e) => e,
        HeaderReadError::Io(source) => io_err(source),
    })?;
    let chunks = index_tracks(&mut reader, file_len);
    drop(reader);

    // Every task reads through its own handle, seeked to its chunk.
    let open = |chunk: &TrackChunk| -> io::Result<_> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(chunk.offset))?;
        Ok(BufReader::with_capacity(DECODE_BUFFER, file).take(chunk.len))
    };
    load_chunks(header, &chunks, options, progress, open)
}

pub fn load_bytes(
    bytes: &[u8],
    options: &LoadOptions,
    progress: &LoadProgress,
) -> Result<Timeline, LoadError> {
    let mut cursor = Cursor::new(bytes);
    let header = read_header(&mut cursor).map_err(|e| match e {
        HeaderReadError::Format(e) => e,
        HeaderReadError::Io(_) => LoadError::TruncatedHeader,
    })?;
    let chunks = index_tracks(&mut cursor, bytes.len() as u64);

    let open = move |chunk: &TrackChunk| {
        let start = chunk.offset as usize;
        Ok::<&[u8], io::Error>(&bytes[start..start + chunk.len as usize])
    };
    load_chunks(header, &chunks, options, progress, open)
}

enum HeaderReadError {
    Format(LoadError),
    Io(io::Error),
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header, HeaderReadError> {
    let mut bytes = [0u8; HEADER_LEN as usize];
    match reader.read_exact(&mut bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(HeaderReadError::Format(LoadError::TruncatedHeader));
        }
        Err(e) => return Err(HeaderReadError::Io(e)),
    }
    Header::parse(&bytes).map_err(HeaderReadError::Format)
}

/// Walks `MTrk` chunks from just past the header to the end of the file.
/// Chunks with any other magic are stepped over by their declared length.
/// A short or unreadable chunk header ends the walk; a track chunk whose
/// declared length runs past the end of the file is clipped to what is there.
pub fn index_tracks<S: Read + Seek>(src: &mut S, file_len: u64) -> Vec<TrackChunk> {
    let mut chunks = Vec::new();
    let mut pos = HEADER_LEN;

    while pos + CHUNK_HEADER_LEN <= file_len {
        let mut chunk_header = [0u8; CHUNK_HEADER_LEN as usize];
        let read = src
            .seek(SeekFrom::Start(pos))
            .and_then(|_| src.read_exact(&mut chunk_header));
        if let Err(e) = read {
            warn!(pos, error = %e, "stopped indexing tracks");
            break;
        }
        let declared = u32::from_be_bytes([
            chunk_header[4],
            chunk_header[5],
            chunk_header[6],
            chunk_header[7],
        ]) as u64;
        let offset = pos + CHUNK_HEADER_LEN;
        if &chunk_header[0..4] != b"MTrk" {
            debug!(
                pos,
                magic = %String::from_utf8_lossy(&chunk_header[0..4]),
                declared,
                "skipping unknown chunk"
            );
            pos = offset + declared;
            continue;
        }
        let len = declared.min(file_len - offset);
        if len < declared {
            warn!(track = chunks.len(), declared, len, "track chunk runs past end of file");
        }

        chunks.push(TrackChunk {
            index: chunks.len(),
            offset,
            len,
        });
        pos = offset + declared;
    }

    chunks
}

fn load_chunks<F, R>(
    header: Header,
    chunks: &[TrackChunk],
    options: &LoadOptions,
    progress: &LoadProgress,
    open: F,
) -> Result<Timeline, LoadError>
where
    F: Fn(&TrackChunk) -> io::Result<R> + Sync,
    R: Read,
{
    progress.reset(chunks);
    let tracks = progress.tracks();
    let to_decode = &chunks[..chunks.len().min(options.track_limit)];
    if header.declared_tracks as usize != chunks.len() {
        debug!(
            declared = header.declared_tracks,
            found = chunks.len(),
            "track count differs from header"
        );
    }

    let results = thread::scope(|scope| -> Result<Vec<TrackParseResult>, LoadError> {
        let mut handles = Vec::with_capacity(to_decode.len());
        for chunk in to_decode {
            let track = &tracks[chunk.index];
            let open = &open;
            let handle = thread::Builder::new()
                .name(format!("track-decode-{}", chunk.index))
                .spawn_scoped(scope, move || {
                    let result = match open(chunk) {
                        Ok(window) => {
                            let reader = TrackReader::new(window).with_progress(&track.consumed);
                            decode_track(reader, options.velocity_threshold)
                        }
                        Err(e) => {
                            warn!(track = chunk.index, error = %e, "could not open track window");
                            TrackParseResult::default()
                        }
                    };
                    progress.record(&result);
                    track.finished.store(true, Ordering::Release);
                    debug!(
                        track = chunk.index,
                        events = result.events.len(),
                        tempos = result.tempos.len(),
                        max_tick = result.max_tick,
                        bytes = result.bytes_consumed,
                        "track decoded"
                    );
                    result
                })
                .map_err(LoadError::Spawn)?;
            handles.push(handle);
        }

        Ok(handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    warn!("track decoder panicked");
                    TrackParseResult::default()
                })
            })
            .collect())
    })?;

    let timeline = merge(header, chunks.len(), results);
    info!(
        tracks = timeline.tracks_decoded,
        events = timeline.events.len(),
        tempos = timeline.tempo.len(),
        max_tick = timeline.max_tick,
        notes_loaded = timeline.notes_loaded,
        notes_total = timeline.notes_total,
        "timeline loaded"
    );
    Ok(timeline)
}

/// Concatenates per-track results in track order, then sorts by tick. Both
/// sorts are stable, so same-tick events keep track order.
fn merge(header: Header, tracks_indexed: usize, results: Vec<TrackParseResult>) -> Timeline {
    let total: usize = results.iter().map(|r| r.events.len()).sum();
    let mut events = Vec::with_capacity(total);
    let mut tempos: Vec<TempoChange> = Vec::new();
    let mut max_tick = 0;
    let mut notes_total = 0;
    let mut notes_loaded = 0;

    let tracks_decoded = results.len();
    for result in results {
        events.extend_from_slice(&result.events);
        tempos.extend_from_slice(&result.tempos);
        max_tick = max_tick.max(result.max_tick);
        notes_total += result.notes_total;
        notes_loaded += result.notes_loaded;
    }
    events.sort_by_key(|e: &Event| e.tick);

    Timeline {
        header,
        events,
        tempo: TempoMap::from_unsorted(tempos),
        tracks_indexed,
        tracks_decoded,
        max_tick,
        notes_total,
        notes_loaded,
    }
}
