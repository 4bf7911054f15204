//! Worker configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use runway_core::models::LivenessConfig;

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier (UUID).
    pub worker_id: String,

    /// Consumer group shared by the workers that split the task queue.
    pub worker_group: String,

    /// Maximum task runs executing at once.
    pub max_concurrent_tasks: usize,

    /// Heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Seconds without heartbeat before the instance is considered disconnected.
    pub liveness_timeout_secs: u64,

    /// Seconds a disconnected instance has before it is forcibly terminated.
    pub termination_grace_period_secs: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let worker_id = std::env::var("WORKER_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let worker_group = std::env::var("WORKER_GROUP")
            .unwrap_or_else(|_| "worker".to_string());

        let max_concurrent: usize = env_or("WORKER_MAX_CONCURRENT", 4);
        if max_concurrent == 0 {
            anyhow::bail!("WORKER_MAX_CONCURRENT must be at least 1");
        }

        let heartbeat_secs: u64 = env_or("WORKER_HEARTBEAT_INTERVAL", 15);

        let config = Self {
            worker_id,
            worker_group,
            max_concurrent_tasks: max_concurrent,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            liveness_timeout_secs: env_or("WORKER_LIVENESS_TIMEOUT", 60),
            termination_grace_period_secs: env_or("WORKER_TERMINATION_GRACE_PERIOD", 300),
        };
        config.check().context("invalid worker configuration")?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.heartbeat_interval.as_secs() >= self.liveness_timeout_secs {
            anyhow::bail!(
                "heartbeat interval ({}s) must be shorter than the liveness timeout ({}s)",
                self.heartbeat_interval.as_secs(),
                self.liveness_timeout_secs
            );
        }
        Ok(())
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            liveness_timeout_secs: self.liveness_timeout_secs,
            termination_grace_period_secs: self.termination_grace_period_secs,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            worker_group: "worker".to_string(),
            max_concurrent_tasks: 4,
            heartbeat_interval: Duration::from_secs(15),
            liveness_timeout_secs: 60,
            termination_grace_period_secs: 300,
        }
    }
}
