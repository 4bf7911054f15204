//! Retry configuration for transport-level re-emission.

use std::time::Duration;

use runway_core::retry::RetryPolicy;
use serde::Deserialize;

/// Exponential retry settings from `RUNWAY_RETRY_*` variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempt")]
    pub max_attempt: u32,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_delay_factor")]
    pub delay_factor: f64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

fn default_max_attempt() -> u32 {
    3
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_delay_factor() -> f64 {
    2.0
}

fn default_max_interval_ms() -> u64 {
    10_000
}

impl RetryConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("RUNWAY_RETRY_").from_env::<RetryConfig>()
    }

    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_millis(self.interval_ms),
            self.delay_factor,
            Duration::from_millis(self.max_interval_ms),
            self.max_attempt,
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempt: default_max_attempt(),
            interval_ms: default_interval_ms(),
            delay_factor: default_delay_factor(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_core_policy() {
        let policy = RetryConfig::default().to_policy();
        assert_eq!(policy, RetryPolicy::default());
        assert!(policy.validate().is_ok());
    }
}
