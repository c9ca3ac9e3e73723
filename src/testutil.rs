use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::backend::{Backend, DeviceDescriptor};
use crate::error::BackendError;

pub fn vlq(mut value: u32) -> Vec<u8> {
    let mut out = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        out.insert(0, (value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    out
}

/// Track payload from `(delta, bytes)` pairs, terminated with End-of-Track.
pub fn track(events: &[(u32, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    for (delta, bytes) in events {
        out.extend(vlq(*delta));
        out.extend_from_slice(bytes);
    }
    out.extend_from_slice(&[0x00, 0xFF, 0x2F, 0x00]);
    out
}

pub struct SmfBuilder {
    format: u16,
    ppq: u16,
    chunks: Vec<([u8; 4], Vec<u8>)>,
    tracks: u16,
}

impl SmfBuilder {
    pub fn new(format: u16, ppq: u16) -> Self {
        Self {
            format,
            ppq,
            chunks: Vec::new(),
            tracks: 0,
        }
    }

    pub fn track(mut self, payload: Vec<u8>) -> Self {
        self.tracks += 1;
        self.chunk(*b"MTrk", payload)
    }

    /// Any chunk; only `track` counts toward the header's track count.
    pub fn chunk(mut self, magic: [u8; 4], payload: Vec<u8>) -> Self {
        self.chunks.push((magic, payload));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"MThd");
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&self.format.to_be_bytes());
        out.extend_from_slice(&self.tracks.to_be_bytes());
        out.extend_from_slice(&self.ppq.to_be_bytes());
        for (magic, payload) in self.chunks {
            out.extend_from_slice(&magic);
            out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            out.extend_from_slice(&payload);
        }
        out
    }
}

/// 120 BPM at 480 PPQ with a note-on/note-off pair at ticks 0, 480, 960 and
/// 1440.
pub fn four_note_file() -> Vec<u8> {
    let events: &[(u32, &[u8])] = &[
        (0, &[0xFF, 0x51, 0x03, 0x07, 0xA1, 0x20]),
        (0, &[0x90, 60, 100]),
        (0, &[0x80, 60, 0]),
        (480, &[0x90, 62, 100]),
        (0, &[0x80, 62, 0]),
        (480, &[0x90, 64, 100]),
        (0, &[0x80, 64, 0]),
        (480, &[0x90, 65, 100]),
        (0, &[0x80, 65, 0]),
    ];
    SmfBuilder::new(0, 480).track(track(events)).build()
}

#[derive(Clone, Default)]
pub struct RecordingBackend {
    pub sent: Arc<Mutex<Vec<(Instant, u32)>>>,
    pub shut_down: Arc<Mutex<bool>>,
    pub fail_init: bool,
}

impl RecordingBackend {
    pub fn messages(&self) -> Vec<u32> {
        self.sent.lock().iter().map(|(_, msg)| *msg).collect()
    }
}

impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn initialize(&mut self, _device: Option<&str>) -> Result<(), BackendError> {
        if self.fail_init {
            return Err(BackendError::Unavailable("recording backend disabled".into()));
        }
        Ok(())
    }

    fn send(&mut self, packed: u32) {
        self.sent.lock().push((Instant::now(), packed));
    }

    fn shutdown(&mut self) {
        *self.shut_down.lock() = true;
    }

    fn enumerate_devices(&self) -> Vec<DeviceDescriptor> {
        vec![DeviceDescriptor {
            index: 0,
            name: "recorder".into(),
        }]
    }
}
