/// A channel-voice message positioned on the merged timeline.
///
/// `packed` holds the status byte (with channel) in bits 0..8, the first data
/// byte in bits 8..16 and the second data byte in bits 16..24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub tick: u32,
    pub packed: u32,
}

impl Event {
    pub fn new(tick: u32, status: u8, data1: u8, data2: u8) -> Self {
        Self {
            tick,
            packed: pack(status, data1, data2),
        }
    }

    pub fn status(&self) -> u8 {
        status(self.packed)
    }

    pub fn channel(&self) -> u8 {
        self.status() & 0x0F
    }

    pub fn data1(&self) -> u8 {
        data1(self.packed)
    }

    pub fn data2(&self) -> u8 {
        data2(self.packed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempoChange {
    pub tick: u32,
    pub micros_per_quarter: u32,
}

impl TempoChange {
    pub fn bpm(&self) -> f64 {
        micros_to_bpm(self.micros_per_quarter)
    }
}

pub const DEFAULT_MICROS_PER_QUARTER: u32 = 500_000;

pub fn micros_to_bpm(micros_per_quarter: u32) -> f64 {
    60_000_000.0 / micros_per_quarter.max(1) as f64
}

pub fn pack(status: u8, data1: u8, data2: u8) -> u32 {
    status as u32 | (data1 as u32) << 8 | (data2 as u32) << 16
}

pub fn status(packed: u32) -> u8 {
    (packed & 0xFF) as u8
}

pub fn data1(packed: u32) -> u8 {
    ((packed >> 8) & 0xFF) as u8
}

pub fn data2(packed: u32) -> u8 {
    ((packed >> 16) & 0xFF) as u8
}

/// Wire length of a packed channel message: program change and channel
/// pressure carry one data byte, everything else two.
pub fn message_len(packed: u32) -> usize {
    match status(packed) & 0xF0 {
        0xC0 | 0xD0 => 2,
        _ => 3,
    }
}

/// Bytes of a packed channel message in wire order.
pub fn unpack(packed: u32) -> ([u8; 3], usize) {
    (
        [status(packed), data1(packed), data2(packed)],
        message_len(packed),
    )
}

/// CC 123 on every channel.
pub fn all_notes_off() -> impl Iterator<Item = u32> {
    (0u8..16).map(|channel| pack(0xB0 | channel, 123, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_status_and_data_bytes() {
        let event = Event::new(10, 0x93, 0x40, 0x7F);
        assert_eq!(event.packed, 0x007F_4093);
        assert_eq!(event.channel(), 3);
        assert_eq!(event.data1(), 0x40);
        assert_eq!(event.data2(), 0x7F);
        assert_eq!(event.status(), 0x93);
    }

    #[test]
    fn single_data_byte_messages_are_two_bytes_long() {
        assert_eq!(unpack(pack(0xC2, 5, 0)), ([0xC2, 5, 0], 2));
        assert_eq!(message_len(pack(0xD0, 9, 0)), 2);
        assert_eq!(message_len(pack(0xE0, 0, 64)), 3);
    }

    #[test]
    fn tempo_converts_to_bpm() {
        let change = TempoChange {
            tick: 0,
            micros_per_quarter: 500_000,
        };
        assert_eq!(change.bpm(), 120.0);
        assert_eq!(all_notes_off().count(), 16);
    }
}
