//! Queue polling configuration.

use std::time::Duration;

use serde::Deserialize;

/// Poller cadence and batch size, from `RUNWAY_QUEUE_*` variables.
///
/// A poller that fetched something within `poll_switch_interval_ms` polls every
/// `min_poll_interval_ms`; once idle for longer it slows to `max_poll_interval_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_min_poll_interval_ms")]
    pub min_poll_interval_ms: u64,

    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,

    #[serde(default = "default_poll_switch_interval_ms")]
    pub poll_switch_interval_ms: u64,

    /// Maximum rows fetched per transaction
    #[serde(default = "default_poll_size")]
    pub poll_size: i64,
}

fn default_min_poll_interval_ms() -> u64 {
    100
}

fn default_max_poll_interval_ms() -> u64 {
    500
}

fn default_poll_switch_interval_ms() -> u64 {
    30_000
}

fn default_poll_size() -> i64 {
    100
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("RUNWAY_QUEUE_").from_env::<QueueConfig>()
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn poll_switch_interval(&self) -> Duration {
        Duration::from_millis(self.poll_switch_interval_ms)
    }

    /// Sleep before the next poll, given the time since the last non-empty fetch.
    pub fn next_poll_interval(&self, since_last_message: Duration) -> Duration {
        if since_last_message < self.poll_switch_interval() {
            self.min_poll_interval()
        } else {
            self.max_poll_interval()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: default_min_poll_interval_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
            poll_switch_interval_ms: default_poll_switch_interval_ms(),
            poll_size: default_poll_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.min_poll_interval(), Duration::from_millis(100));
        assert_eq!(config.max_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.poll_switch_interval(), Duration::from_secs(30));
        assert_eq!(config.poll_size, 100);
    }

    #[test]
    fn test_adaptive_interval() {
        let config = QueueConfig::default();
        assert_eq!(
            config.next_poll_interval(Duration::from_secs(1)),
            config.min_poll_interval()
        );
        assert_eq!(
            config.next_poll_interval(Duration::from_secs(31)),
            config.max_poll_interval()
        );
    }
}
