use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::dispatch::RingStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Loading,
    Playing,
    Paused,
}

impl PlayerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlayerState::Loading,
            2 => PlayerState::Playing,
            3 => PlayerState::Paused,
            _ => PlayerState::Idle,
        }
    }
}

/// `f64` stored as its bit pattern.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Numbers published for an observer that polls at its own cadence.
/// The scheduler and dispatch threads write; nobody waits on them.
#[derive(Debug)]
pub struct Telemetry {
    pub current_tick: AtomicF64,
    pub ticks_per_second: AtomicF64,
    pub bpm: AtomicF64,
    pub max_tick: AtomicU64,
    pub ring: Arc<RingStats>,
    state: AtomicU8,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            current_tick: AtomicF64::new(0.0),
            ticks_per_second: AtomicF64::new(0.0),
            bpm: AtomicF64::new(0.0),
            max_tick: AtomicU64::new(0),
            ring: Arc::new(RingStats::default()),
            state: AtomicU8::new(0),
        }
    }
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> PlayerState {
        PlayerState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: PlayerState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn dispatched(&self) -> u64 {
        self.ring.dispatched()
    }

    pub fn dropped(&self) -> u64 {
        self.ring.dropped()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            state: self.state(),
            current_tick: self.current_tick.load(),
            max_tick: self.max_tick.load(Ordering::Relaxed),
            ticks_per_second: self.ticks_per_second.load(),
            bpm: self.bpm.load(),
            dispatched: self.dispatched(),
            dropped: self.dropped(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySnapshot {
    pub state: PlayerState,
    pub current_tick: f64,
    pub max_tick: u64,
    pub ticks_per_second: f64,
    pub bpm: f64,
    pub dispatched: u64,
    pub dropped: u64,
}
