use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicU64, Ordering};

/// Reading past the end of a track window. This is how a track ends when it
/// has no End-of-Track meta event, so callers stop decoding instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndOfChunk;

pub type ReadResult<T> = Result<T, EndOfChunk>;

/// Longest variable-length quantity accepted, in encoded bytes.
pub const MAX_VLQ_BYTES: usize = 4;

const PROGRESS_STRIDE: u64 = 4096;

/// Byte reader over one track chunk window.
///
/// The window is whatever `R` yields: a slice of an in-memory image, or a file
/// handle bounded with [`Read::take`]. One byte can be pushed back, which is
/// how running status hands a data byte back to the message parser.
pub struct TrackReader<'p, R> {
    inner: R,
    pushed_back: Option<u8>,
    consumed: u64,
    progress: Option<&'p AtomicU64>,
}

impl<'p, R: Read> TrackReader<'p, R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pushed_back: None,
            consumed: 0,
            progress: None,
        }
    }

    /// Publishes the consumed byte count to `progress` as decoding proceeds.
    pub fn with_progress(mut self, progress: &'p AtomicU64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn read_u8(&mut self) -> ReadResult<u8> {
        if let Some(byte) = self.pushed_back.take() {
            return Ok(byte);
        }

        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Err(EndOfChunk),
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, consumed = self.consumed, "track read failed");
                    return Err(EndOfChunk);
                }
            }
        }

        self.consumed += 1;
        if self.consumed % PROGRESS_STRIDE == 0 {
            self.publish_progress();
        }
        Ok(buf[0])
    }

    pub fn push_back(&mut self, byte: u8) {
        debug_assert!(self.pushed_back.is_none(), "only one byte of pushback");
        self.pushed_back = Some(byte);
    }

    pub fn skip(&mut self, count: u32) -> ReadResult<()> {
        for _ in 0..count {
            self.read_u8()?;
        }
        Ok(())
    }

    /// Big-endian base-128 integer with a continuation bit in each byte.
    /// At most [`MAX_VLQ_BYTES`] bytes are consumed, so the result never
    /// exceeds `0x0FFF_FFFF`.
    pub fn read_vlq(&mut self) -> ReadResult<u32> {
        let mut value = 0u32;
        for _ in 0..MAX_VLQ_BYTES {
            let byte = self.read_u8()?;
            value = (value << 7) | (byte & 0x7F) as u32;
            if byte & 0x80 == 0 {
                break;
            }
        }
        Ok(value)
    }

    pub fn read_u24(&mut self) -> ReadResult<u32> {
        let mut value = 0u32;
        for _ in 0..3 {
            value = (value << 8) | self.read_u8()? as u32;
        }
        Ok(value)
    }

    pub fn publish_progress(&self) {
        if let Some(progress) = self.progress {
            progress.store(self.consumed, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vlq(bytes: &[u8]) -> ReadResult<u32> {
        TrackReader::new(bytes).read_vlq()
    }

    #[test]
    fn decodes_single_byte_quantity() {
        assert_eq!(vlq(&[0x00]), Ok(0));
        assert_eq!(vlq(&[0x7F]), Ok(127));
    }

    #[test]
    fn decodes_multi_byte_quantity() {
        assert_eq!(vlq(&[0x81, 0x00]), Ok(128));
        assert_eq!(vlq(&[0xC0, 0x00]), Ok(0x2000));
    }

    #[test]
    fn four_byte_quantity_saturates_without_wrapping() {
        assert_eq!(vlq(&[0xFF, 0xFF, 0xFF, 0x7F]), Ok(0x0FFF_FFFF));
    }

    #[test]
    fn stops_after_four_bytes_even_with_continuation() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x05];
        let mut reader = TrackReader::new(&bytes[..]);
        assert_eq!(reader.read_vlq(), Ok(0x0FFF_FFFF));
        assert_eq!(reader.read_u8(), Ok(0x05));
    }

    #[test]
    fn truncated_quantity_reports_end_of_chunk() {
        assert_eq!(vlq(&[0x81]), Err(EndOfChunk));
        assert_eq!(vlq(&[]), Err(EndOfChunk));
    }

    #[test]
    fn pushed_back_byte_is_read_again() {
        let bytes = [0x10, 0x20];
        let mut reader = TrackReader::new(&bytes[..]);
        let first = reader.read_u8().unwrap();
        reader.push_back(first);
        assert_eq!(reader.read_u8(), Ok(0x10));
        assert_eq!(reader.read_u8(), Ok(0x20));
        assert_eq!(reader.consumed(), 2);
    }

    #[test]
    fn reads_big_endian_u24() {
        let bytes = [0x07, 0xA1, 0x20];
        let mut reader = TrackReader::new(&bytes[..]);
        assert_eq!(reader.read_u24(), Ok(500_000));
    }

    #[test]
    fn publishes_consumed_bytes() {
        let progress = AtomicU64::new(0);
        let bytes = [1, 2, 3];
        let mut reader = TrackReader::new(&bytes[..]).with_progress(&progress);
        reader.skip(3).unwrap();
        reader.publish_progress();
        assert_eq!(progress.load(Ordering::Relaxed), 3);
    }
}
