mod clock;
mod scheduler;

pub use clock::{LagPolicy, MusicalClock, THROTTLE_CEILING};
pub use scheduler::{
    PlaybackControls, PlaybackOutcome, PlaybackState, Scheduler, SchedulerConfig,
};
