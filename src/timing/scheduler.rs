use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use super::clock::{LagPolicy, MusicalClock};
use crate::dispatch::RingProducer;
use crate::events;
use crate::smf::Timeline;
use crate::telemetry::{AtomicF64, PlayerState, Telemetry};

/// Commands another thread can give a running scheduler. Each one is read
/// once per iteration.
#[derive(Debug)]
pub struct PlaybackControls {
    cancelled: AtomicBool,
    paused: AtomicBool,
    speed: AtomicF64,
}

impl PlaybackControls {
    pub fn new(speed: f64) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            speed: AtomicF64::new(speed),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_speed(&self, speed: f64) {
        self.speed.store(speed);
    }

    pub fn speed(&self) -> f64 {
        self.speed.load()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Finished,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackState {
    pub current_tick: f64,
    pub tempo_cursor: usize,
    pub event_cursor: usize,
    pub running: bool,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub speed: f64,
    pub lag_policy: LagPolicy,
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            lag_policy: LagPolicy::default(),
            poll_interval: Duration::from_micros(500),
        }
    }
}

/// Walks a timeline against the musical clock and feeds due events into the
/// dispatch ring. It is the only writer of its [`PlaybackState`] and the only
/// producer of its ring.
pub struct Scheduler {
    timeline: Arc<Timeline>,
    clock: MusicalClock,
    state: PlaybackState,
    producer: RingProducer,
    controls: Arc<PlaybackControls>,
    telemetry: Arc<Telemetry>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        timeline: Arc<Timeline>,
        producer: RingProducer,
        controls: Arc<PlaybackControls>,
        telemetry: Arc<Telemetry>,
        config: SchedulerConfig,
    ) -> Self {
        let clock = MusicalClock::new(timeline.ppq(), config.speed, config.lag_policy);
        Self {
            timeline,
            clock,
            state: PlaybackState::default(),
            producer,
            controls,
            telemetry,
            poll_interval: config.poll_interval,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn clock(&self) -> &MusicalClock {
        &self.clock
    }

    pub fn start_at(&mut self, now: Instant) {
        self.clock.start_at(now);
        self.state = PlaybackState {
            running: true,
            ..PlaybackState::default()
        };
        self.telemetry
            .max_tick
            .store(self.timeline.max_tick as u64, Ordering::Relaxed);
        self.telemetry.set_state(PlayerState::Playing);
        self.publish();
    }

    /// One scheduler iteration at `now`. Returns the outcome once playback
    /// is over.
    pub fn step(&mut self, now: Instant) -> Option<PlaybackOutcome> {
        if self.controls.is_cancelled() {
            return Some(PlaybackOutcome::Cancelled);
        }
        self.apply_controls(now);
        if self.state.paused {
            return None;
        }

        let mut tick = self.clock.get_tick_at(now);

        let tempos = self.timeline.tempo.changes();
        while let Some(change) = tempos.get(self.state.tempo_cursor) {
            if change.tick as f64 > tick {
                break;
            }
            self.clock
                .submit_tempo_at(now, change.tick, change.micros_per_quarter);
            tick = self.clock.current_tick();
            self.state.tempo_cursor += 1;
            debug!(tick = change.tick, bpm = change.bpm(), "tempo change");
        }

        let events = &self.timeline.events;
        let first = self.state.event_cursor;
        while let Some(event) = events.get(self.state.event_cursor) {
            if event.tick as f64 > tick {
                break;
            }
            self.producer.submit(event.packed);
            self.state.event_cursor += 1;
        }
        if self.state.event_cursor > first {
            trace!(tick, count = self.state.event_cursor - first, "dispatched");
        }

        self.state.current_tick = tick;
        self.publish();

        if tick > self.timeline.max_tick as f64 {
            return Some(PlaybackOutcome::Finished);
        }
        None
    }

    /// Runs on the calling thread until finished or cancelled.
    pub fn run(mut self) -> PlaybackOutcome {
        info!(
            events = self.timeline.events.len(),
            max_tick = self.timeline.max_tick,
            speed = self.clock.speed(),
            policy = ?self.clock.policy(),
            "playback started"
        );
        self.start_at(Instant::now());

        let outcome = loop {
            if let Some(outcome) = self.step(Instant::now()) {
                break outcome;
            }
            thread::sleep(self.poll_interval);
        };

        if outcome == PlaybackOutcome::Cancelled {
            for packed in events::all_notes_off() {
                self.producer.submit(packed);
            }
        }

        self.state.running = false;
        self.clock.reset();
        self.telemetry.set_state(PlayerState::Idle);
        info!(
            ?outcome,
            tick = self.state.current_tick,
            dispatched = self.state.event_cursor,
            "playback ended"
        );
        outcome
    }

    /// Runs on a new thread. `on_done` is called with the outcome on that
    /// thread before it exits.
    pub fn spawn<F>(self, on_done: F) -> io::Result<JoinHandle<PlaybackOutcome>>
    where
        F: FnOnce(PlaybackOutcome) + Send + 'static,
    {
        thread::Builder::new()
            .name("midi-scheduler".into())
            .spawn(move || {
                let outcome = self.run();
                on_done(outcome);
                outcome
            })
    }

    fn apply_controls(&mut self, now: Instant) {
        let paused = self.controls.is_paused();
        if paused != self.state.paused {
            if paused {
                self.clock.pause_at(now);
                self.telemetry.set_state(PlayerState::Paused);
            } else {
                self.clock.resume_at(now);
                self.telemetry.set_state(PlayerState::Playing);
            }
            self.state.paused = paused;
            debug!(paused, tick = self.clock.current_tick(), "pause toggled");
        }

        let speed = self.controls.speed();
        if speed != self.clock.speed() && speed.is_finite() && speed > 0.0 {
            self.clock.set_speed_at(now, speed);
            debug!(speed, "speed changed");
        }
    }

    fn publish(&self) {
        self.telemetry.current_tick.store(self.state.current_tick);
        self.telemetry
            .ticks_per_second
            .store(self.clock.ticks_per_second());
        self.telemetry.bpm.store(self.clock.bpm());
    }
}
