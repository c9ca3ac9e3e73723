use crate::events::{DEFAULT_MICROS_PER_QUARTER, TempoChange};

/// Tempo changes ordered by tick. Ties keep the order the tracks produced
/// them in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TempoMap {
    changes: Vec<TempoChange>,
}

impl TempoMap {
    pub fn from_unsorted(mut changes: Vec<TempoChange>) -> Self {
        changes.sort_by_key(|change| change.tick);
        Self { changes }
    }

    pub fn changes(&self) -> &[TempoChange] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Tempo in effect at `tick`. Before the first change the MIDI default of
    /// 120 BPM applies. When several changes share a tick the last one wins,
    /// which is what applying them in order leaves behind.
    pub fn micros_per_quarter_at(&self, tick: u32) -> u32 {
        let idx = self.changes.partition_point(|change| change.tick <= tick);
        match idx {
            0 => DEFAULT_MICROS_PER_QUARTER,
            n => self.changes[n - 1].micros_per_quarter,
        }
    }

    /// Wall-clock length of `[0, tick)` at normal speed.
    pub fn ticks_to_seconds(&self, tick: u32, ppq: u16) -> f64 {
        let ppq = ppq.max(1) as f64;
        let mut seconds = 0.0;
        let mut cursor = 0u32;
        let mut micros = DEFAULT_MICROS_PER_QUARTER;

        for change in &self.changes {
            if change.tick >= tick {
                break;
            }
            seconds += (change.tick - cursor) as f64 * micros as f64 / 1e6 / ppq;
            cursor = change.tick;
            micros = change.micros_per_quarter;
        }

        seconds + (tick - cursor) as f64 * micros as f64 / 1e6 / ppq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(tick: u32, micros_per_quarter: u32) -> TempoChange {
        TempoChange {
            tick,
            micros_per_quarter,
        }
    }

    #[test]
    fn sorts_by_tick_keeping_tie_order() {
        let map = TempoMap::from_unsorted(vec![
            change(960, 400_000),
            change(0, 500_000),
            change(960, 300_000),
        ]);
        let ticks: Vec<_> = map.changes().iter().map(|c| c.tick).collect();
        assert_eq!(ticks, vec![0, 960, 960]);
        assert_eq!(map.changes()[1].micros_per_quarter, 400_000);
        assert_eq!(map.micros_per_quarter_at(960), 300_000);
    }

    #[test]
    fn tempo_is_constant_between_boundaries() {
        let map = TempoMap::from_unsorted(vec![change(480, 250_000), change(1440, 1_000_000)]);
        assert_eq!(map.micros_per_quarter_at(0), DEFAULT_MICROS_PER_QUARTER);
        assert_eq!(map.micros_per_quarter_at(479), DEFAULT_MICROS_PER_QUARTER);
        assert_eq!(map.micros_per_quarter_at(480), 250_000);
        assert_eq!(map.micros_per_quarter_at(1439), 250_000);
        assert_eq!(map.micros_per_quarter_at(1440), 1_000_000);
    }

    #[test]
    fn converts_ticks_to_seconds_across_changes() {
        let map = TempoMap::from_unsorted(vec![change(0, 500_000), change(480, 1_000_000)]);
        assert!((map.ticks_to_seconds(480, 480) - 0.5).abs() < 1e-9);
        assert!((map.ticks_to_seconds(960, 480) - 1.5).abs() < 1e-9);
        assert_eq!(TempoMap::default().ticks_to_seconds(0, 480), 0.0);
    }
}
