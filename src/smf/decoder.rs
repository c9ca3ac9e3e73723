use std::io::Read;

use super::reader::{ReadResult, TrackReader};
use crate::events::{Event, TempoChange};

const CHANNELS: usize = 16;
const NOTES: usize = 128;

/// Pending suppressed note-ons, one counter per channel and note.
///
/// A note-on below the velocity threshold bumps its slot. The next note-off
/// for that slot consumes one count and is dropped with it; a note-off that
/// finds the slot empty is always emitted, matched or not.
pub struct SkipTable {
    slots: Box<[[u16; NOTES]; CHANNELS]>,
}

impl SkipTable {
    pub fn new() -> Self {
        Self {
            slots: Box::new([[0; NOTES]; CHANNELS]),
        }
    }

    pub fn suppress(&mut self, channel: u8, note: u8) {
        let slot = &mut self.slots[channel as usize & 0x0F][note as usize & 0x7F];
        *slot = slot.saturating_add(1);
    }

    /// Consumes one pending suppression; `true` when the note-off must be
    /// dropped.
    pub fn take(&mut self, channel: u8, note: u8) -> bool {
        let slot = &mut self.slots[channel as usize & 0x0F][note as usize & 0x7F];
        if *slot > 0 {
            *slot -= 1;
            true
        } else {
            false
        }
    }

    pub fn pending(&self, channel: u8, note: u8) -> u16 {
        self.slots[channel as usize & 0x0F][note as usize & 0x7F]
    }
}

impl Default for SkipTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything one track contributes to the timeline.
#[derive(Debug, Default)]
pub struct TrackParseResult {
    pub events: Vec<Event>,
    pub tempos: Vec<TempoChange>,
    /// Note-ons with non-zero velocity seen in the track.
    pub notes_total: u64,
    /// Note-ons kept after velocity suppression.
    pub notes_loaded: u64,
    /// Tick reached when decoding stopped.
    pub max_tick: u32,
    pub bytes_consumed: u64,
}

pub struct TrackDecoder<'p, R> {
    reader: TrackReader<'p, R>,
    threshold: u8,
    skip: SkipTable,
    tick: u32,
    running_status: Option<u8>,
    out: TrackParseResult,
}

enum Step {
    Continue,
    EndOfTrack,
}

impl<'p, R: Read> TrackDecoder<'p, R> {
    pub fn new(reader: TrackReader<'p, R>, threshold: u8) -> Self {
        Self {
            reader,
            threshold: threshold.min(127),
            skip: SkipTable::new(),
            tick: 0,
            running_status: None,
            out: TrackParseResult::default(),
        }
    }

    /// Decodes until End-of-Track or the end of the window, whichever comes
    /// first. Running off the window is the normal end of a track.
    pub fn decode(mut self) -> TrackParseResult {
        loop {
            match self.step() {
                Ok(Step::Continue) => {}
                Ok(Step::EndOfTrack) | Err(_) => break,
            }
        }

        self.reader.publish_progress();
        self.out.max_tick = self.tick;
        self.out.bytes_consumed = self.reader.consumed();
        self.out
    }

    fn step(&mut self) -> ReadResult<Step> {
        let delta = self.reader.read_vlq()?;
        self.tick = self.tick.saturating_add(delta);

        let mut status = self.reader.read_u8()?;
        if status & 0x80 == 0 {
            match self.running_status {
                Some(previous) => {
                    self.reader.push_back(status);
                    status = previous;
                }
                // Data byte with nothing to run on.
                None => return Ok(Step::Continue),
            }
        }

        match status & 0xF0 {
            0x80 => {
                self.running_status = Some(status);
                let note = self.reader.read_u8()?;
                let velocity = self.reader.read_u8()?;
                self.note_off(status, note, velocity);
            }
            0x90 => {
                self.running_status = Some(status);
                let note = self.reader.read_u8()?;
                let velocity = self.reader.read_u8()?;
                if velocity == 0 {
                    self.note_off(status, note, velocity);
                } else {
                    self.note_on(status, note, velocity);
                }
            }
            0xA0 | 0xB0 | 0xE0 => {
                self.running_status = Some(status);
                let data1 = self.reader.read_u8()?;
                let data2 = self.reader.read_u8()?;
                self.emit(status, data1, data2);
            }
            0xC0 | 0xD0 => {
                self.running_status = Some(status);
                let data1 = self.reader.read_u8()?;
                self.emit(status, data1, 0);
            }
            _ => return self.system(status),
        }

        Ok(Step::Continue)
    }

    fn system(&mut self, status: u8) -> ReadResult<Step> {
        match status {
            0xF0 => {
                self.running_status = None;
                while self.reader.read_u8()? != 0xF7 {}
            }
            0xF7 => {
                self.running_status = None;
                let len = self.reader.read_vlq()?;
                self.reader.skip(len)?;
            }
            0xF2 => self.reader.skip(2)?,
            0xF3 => self.reader.skip(1)?,
            0xFF => return self.meta(),
            _ => {}
        }
        Ok(Step::Continue)
    }

    fn meta(&mut self) -> ReadResult<Step> {
        match self.reader.read_u8()? {
            0x51 => {
                let len = self.reader.read_vlq()?;
                if len < 3 {
                    self.reader.skip(len)?;
                    return Ok(Step::Continue);
                }
                let micros_per_quarter = self.reader.read_u24()?;
                self.reader.skip(len - 3)?;
                self.out.tempos.push(TempoChange {
                    tick: self.tick,
                    micros_per_quarter,
                });
            }
            0x2F => return Ok(Step::EndOfTrack),
            _ => {
                let len = self.reader.read_vlq()?;
                self.reader.skip(len)?;
            }
        }
        Ok(Step::Continue)
    }

    fn note_on(&mut self, status: u8, note: u8, velocity: u8) {
        self.out.notes_total += 1;
        if velocity >= self.threshold {
            self.out.notes_loaded += 1;
            self.emit(status, note, velocity);
        } else {
            self.skip.suppress(status & 0x0F, note);
        }
    }

    fn note_off(&mut self, status: u8, note: u8, velocity: u8) {
        if !self.skip.take(status & 0x0F, note) {
            self.emit(status, note, velocity);
        }
    }

    fn emit(&mut self, status: u8, data1: u8, data2: u8) {
        self.out.events.push(Event::new(self.tick, status, data1, data2));
    }
}

/// Decodes one track window with the given velocity threshold.
pub fn decode_track<R: Read>(reader: TrackReader<'_, R>, threshold: u8) -> TrackParseResult {
    TrackDecoder::new(reader, threshold).decode()
}
