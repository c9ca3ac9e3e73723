use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::BackendKind;
use crate::dispatch::{BackoffPolicy, DEFAULT_CAPACITY, DispatchConfig};
use crate::error::ConfigError;
use crate::smf::LoadOptions;
use crate::timing::{LagPolicy, SchedulerConfig};

/// Everything the player can be told up front. Stored as RON; any field
/// left out of the file takes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Note-ons below this velocity are dropped at load time.
    pub velocity_threshold: u8,
    pub track_limit: usize,
    pub speed: f64,
    pub lag_policy: LagPolicy,
    pub backoff: BackoffPolicy,
    pub ring_capacity: usize,
    pub poll_interval_us: u64,
    pub join_timeout_ms: u64,
    pub backend: BackendKind,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            velocity_threshold: 0,
            track_limit: usize::MAX,
            speed: 1.0,
            lag_policy: LagPolicy::default(),
            backoff: BackoffPolicy::default(),
            ring_capacity: DEFAULT_CAPACITY,
            poll_interval_us: 500,
            join_timeout_ms: 500,
            backend: BackendKind::default(),
        }
    }
}

impl PlayerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: PlayerConfig = ron::from_str(&text)?;
        info!(path = %path.display(), "config loaded");
        Ok(config.normalized())
    }

    /// Like [`PlayerConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let text = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, text).map_err(io_err)
    }

    /// Clamps every field into its valid range.
    pub fn normalized(mut self) -> Self {
        self.velocity_threshold = self.velocity_threshold.min(127);
        if !self.speed.is_finite() || self.speed <= 0.0 {
            self.speed = 1.0;
        }
        self.ring_capacity = self.ring_capacity.max(2).next_power_of_two();
        self.poll_interval_us = self.poll_interval_us.max(1);
        self
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            velocity_threshold: self.velocity_threshold,
            track_limit: self.track_limit,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            speed: self.speed,
            lag_policy: self.lag_policy,
            poll_interval: Duration::from_micros(self.poll_interval_us),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            capacity: self.ring_capacity,
            backoff: self.backoff,
            join_timeout: Duration::from_millis(self.join_timeout_ms),
            device: self.backend.device().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: PlayerConfig = ron::from_str(
            r#"(
                speed: 1.5,
                lag_policy: Skip,
                backoff: SpinSleep(sleep_us: 200),
                backend: Midi(port: Some("fluid")),
            )"#,
        )
        .unwrap();

        assert_eq!(config.speed, 1.5);
        assert_eq!(config.lag_policy, LagPolicy::Skip);
        assert_eq!(config.backoff, BackoffPolicy::SpinSleep { sleep_us: 200 });
        assert_eq!(config.track_limit, usize::MAX);
        assert_eq!(config.ring_capacity, DEFAULT_CAPACITY);
        assert_eq!(config.dispatch_config().device.as_deref(), Some("fluid"));
    }

    #[test]
    fn normalizes_out_of_range_values() {
        let config = PlayerConfig {
            velocity_threshold: 200,
            speed: -3.0,
            ring_capacity: 1000,
            poll_interval_us: 0,
            ..PlayerConfig::default()
        }
        .normalized();

        assert_eq!(config.velocity_threshold, 127);
        assert_eq!(config.speed, 1.0);
        assert_eq!(config.ring_capacity, 1024);
        assert_eq!(config.scheduler_config().poll_interval, Duration::from_micros(1));
    }

    #[test]
    fn saves_then_loads_from_disk() {
        let path = std::env::temp_dir()
            .join(format!("smfplay-config-{}", std::process::id()))
            .join("player.ron");
        let config = PlayerConfig {
            backend: BackendKind::Synth,
            velocity_threshold: 10,
            ..PlayerConfig::default()
        };
        config.save(&path).unwrap();
        let loaded = PlayerConfig::load_or_default(&path).unwrap();
        let _ = fs::remove_dir_all(path.parent().unwrap());

        assert_eq!(loaded.backend, BackendKind::Synth);
        assert_eq!(loaded.load_options().velocity_threshold, 10);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("smfplay-does-not-exist.ron");
        assert_eq!(
            PlayerConfig::load_or_default(&path).unwrap(),
            PlayerConfig::default()
        );
    }
}
