use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::events::{DEFAULT_MICROS_PER_QUARTER, micros_to_bpm};

/// Largest wall-clock step a single sample may advance under
/// [`LagPolicy::Throttle`].
pub const THROTTLE_CEILING: Duration = Duration::from_micros(16_667);

/// What the clock does when playback falls behind, e.g. after the scheduler
/// thread was descheduled for a while.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LagPolicy {
    /// Each sample advances by at most [`THROTTLE_CEILING`] of wall time.
    /// Playback drifts late under load but never floods the backend.
    #[default]
    Throttle,
    /// Apply the full elapsed time and fast-forward through whatever is due.
    Skip,
}

/// Converts elapsed wall time into fractional ticks.
///
/// All `*_at` methods take the current instant explicitly; the plain variants
/// read [`Instant::now`].
#[derive(Debug, Clone)]
pub struct MusicalClock {
    ppq: u16,
    speed: f64,
    policy: LagPolicy,
    micros_per_quarter: u32,
    /// Seconds per tick at the current tempo and speed.
    tick_len: f64,
    tick: f64,
    paused: bool,
    last: Instant,
}

impl MusicalClock {
    pub fn new(ppq: u16, speed: f64, policy: LagPolicy) -> Self {
        let mut clock = Self {
            ppq: ppq.max(1),
            speed: sanitize_speed(speed),
            policy,
            micros_per_quarter: DEFAULT_MICROS_PER_QUARTER,
            tick_len: 0.0,
            tick: 0.0,
            paused: false,
            last: Instant::now(),
        };
        clock.recompute();
        clock
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        self.tick = 0.0;
        self.paused = false;
        self.last = now;
        self.micros_per_quarter = DEFAULT_MICROS_PER_QUARTER;
        self.recompute();
    }

    /// Back to the just-constructed state.
    pub fn reset(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn get_tick(&mut self) -> f64 {
        self.get_tick_at(Instant::now())
    }

    pub fn get_tick_at(&mut self, now: Instant) -> f64 {
        self.advance(now);
        self.tick
    }

    /// Tick value without sampling the wall clock.
    pub fn current_tick(&self) -> f64 {
        self.tick
    }

    pub fn submit_tempo(&mut self, checkpoint: u32, micros_per_quarter: u32) {
        self.submit_tempo_at(Instant::now(), checkpoint, micros_per_quarter);
    }

    /// Switches to a new tempo. Time elapsed since the last sample is folded
    /// in at the old rate first, and the tick never drops below `checkpoint`.
    pub fn submit_tempo_at(&mut self, now: Instant, checkpoint: u32, micros_per_quarter: u32) {
        self.advance(now);
        self.micros_per_quarter = micros_per_quarter.max(1);
        self.recompute();
        self.tick = self.tick.max(checkpoint as f64);
    }

    pub fn set_speed(&mut self, speed: f64) {
        self.set_speed_at(Instant::now(), speed);
    }

    pub fn set_speed_at(&mut self, now: Instant, speed: f64) {
        self.advance(now);
        self.speed = sanitize_speed(speed);
        self.recompute();
    }

    pub fn pause(&mut self) {
        self.pause_at(Instant::now());
    }

    pub fn pause_at(&mut self, now: Instant) {
        self.advance(now);
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.resume_at(Instant::now());
    }

    pub fn resume_at(&mut self, now: Instant) {
        self.last = now;
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn policy(&self) -> LagPolicy {
        self.policy
    }

    pub fn micros_per_quarter(&self) -> u32 {
        self.micros_per_quarter
    }

    pub fn bpm(&self) -> f64 {
        micros_to_bpm(self.micros_per_quarter)
    }

    pub fn tick_len(&self) -> f64 {
        self.tick_len
    }

    pub fn ticks_per_second(&self) -> f64 {
        1.0 / self.tick_len
    }

    fn advance(&mut self, now: Instant) {
        if self.paused {
            return;
        }
        let mut elapsed = now.saturating_duration_since(self.last);
        self.last = now;
        if self.policy == LagPolicy::Throttle {
            elapsed = elapsed.min(THROTTLE_CEILING);
        }
        self.tick += elapsed.as_secs_f64() / self.tick_len;
    }

    fn recompute(&mut self) {
        self.tick_len =
            self.micros_per_quarter as f64 / 1e6 / self.ppq as f64 / self.speed;
    }
}

fn sanitize_speed(speed: f64) -> f64 {
    if speed.is_finite() && speed > 0.0 {
        speed
    } else {
        1.0
    }
}
