use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;
use serde::{Deserialize, Serialize};

/// How the dispatch consumer waits while the ring is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackoffPolicy {
    /// Busy-spin only. Lowest latency, one core pinned.
    Spin,
    /// Spin briefly, then yield the time slice between polls.
    #[default]
    SpinYield,
    /// Spin and yield, then sleep `sleep_us` between polls once idle for a
    /// while.
    SpinSleep { sleep_us: u64 },
}

pub struct IdleWait {
    policy: BackoffPolicy,
    backoff: Backoff,
}

impl IdleWait {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            backoff: Backoff::new(),
        }
    }

    /// Called whenever a message was found.
    pub fn reset(&self) {
        self.backoff.reset();
    }

    /// Called once per empty poll.
    pub fn wait(&self) {
        match self.policy {
            BackoffPolicy::Spin => self.backoff.spin(),
            BackoffPolicy::SpinYield => self.backoff.snooze(),
            BackoffPolicy::SpinSleep { sleep_us } => {
                if self.backoff.is_completed() {
                    thread::sleep(Duration::from_micros(sleep_us));
                } else {
                    self.backoff.snooze();
                }
            }
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn sleep_policy_sleeps_once_backoff_completes() {
        let idle = IdleWait::new(BackoffPolicy::SpinSleep { sleep_us: 2_000 });
        for _ in 0..32 {
            idle.wait();
        }
        let started = Instant::now();
        idle.wait();
        assert!(started.elapsed() >= Duration::from_millis(2));
    }

    #[test]
    fn spin_policy_never_sleeps() {
        let idle = IdleWait::new(BackoffPolicy::Spin);
        assert_eq!(idle.policy(), BackoffPolicy::Spin);
        let started = Instant::now();
        for _ in 0..1_000 {
            idle.wait();
        }
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
