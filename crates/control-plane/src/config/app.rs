//! Application configuration for the Runway control plane.

use std::time::Duration;

use runway_core::models::LivenessConfig;
use runway_core::triggers::ScheduleTolerance;
use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `RUNWAY_`:
/// - `RUNWAY_SERVER_NAME`: Server name for identification
/// - `RUNWAY_EXECUTOR_GROUP`, `RUNWAY_FLOW_TRIGGER_GROUP`: consumer group names
/// - `RUNWAY_SCHEDULER_TICK_SECS`: delay between scheduler evaluations
/// - `RUNWAY_SCHEDULE_LATE_TOLERANCE_SECS`, `RUNWAY_SCHEDULE_FUTURE_TOLERANCE_SECS`
/// - `RUNWAY_LIVENESS_TIMEOUT_SECS`, `RUNWAY_TERMINATION_GRACE_PERIOD_SECS`
/// - `RUNWAY_HEARTBEAT_INTERVAL_SECS`, `RUNWAY_LIVENESS_SWEEP_INTERVAL_SECS`
/// - `RUNWAY_EXECUTOR_MAX_PASSES`: resolver passes per executor message
/// - `RUNWAY_FLOWS_DIR`: directory of flow YAML files loaded at startup
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_server_name")]
    pub server_name: String,

    #[serde(default = "default_executor_group")]
    pub executor_group: String,

    #[serde(default = "default_flow_trigger_group")]
    pub flow_trigger_group: String,

    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,

    #[serde(default = "default_late_tolerance_secs")]
    pub schedule_late_tolerance_secs: i64,

    #[serde(default = "default_future_tolerance_secs")]
    pub schedule_future_tolerance_secs: i64,

    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,

    #[serde(default = "default_termination_grace_period_secs")]
    pub termination_grace_period_secs: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_liveness_sweep_interval_secs")]
    pub liveness_sweep_interval_secs: u64,

    #[serde(default = "default_executor_max_passes")]
    pub executor_max_passes: usize,

    #[serde(default)]
    pub flows_dir: Option<String>,
}

fn default_server_name() -> String {
    "runway-control-plane".to_string()
}

fn default_executor_group() -> String {
    "executor".to_string()
}

fn default_flow_trigger_group() -> String {
    "flow-trigger".to_string()
}

fn default_scheduler_tick_secs() -> u64 {
    1
}

fn default_late_tolerance_secs() -> i64 {
    60
}

fn default_future_tolerance_secs() -> i64 {
    1
}

fn default_liveness_timeout_secs() -> u64 {
    60
}

fn default_termination_grace_period_secs() -> u64 {
    300
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_liveness_sweep_interval_secs() -> u64 {
    15
}

fn default_executor_max_passes() -> usize {
    runway_core::engine::DEFAULT_MAX_PASSES
}

impl AppConfig {
    /// Load configuration from `RUNWAY_*` environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("RUNWAY_").from_env::<AppConfig>()
    }

    pub fn schedule_tolerance(&self) -> ScheduleTolerance {
        ScheduleTolerance {
            late: chrono::Duration::seconds(self.schedule_late_tolerance_secs),
            future: chrono::Duration::seconds(self.schedule_future_tolerance_secs),
        }
    }

    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            liveness_timeout_secs: self.liveness_timeout_secs,
            termination_grace_period_secs: self.termination_grace_period_secs,
        }
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn liveness_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_sweep_interval_secs.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            executor_group: default_executor_group(),
            flow_trigger_group: default_flow_trigger_group(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
            schedule_late_tolerance_secs: default_late_tolerance_secs(),
            schedule_future_tolerance_secs: default_future_tolerance_secs(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            termination_grace_period_secs: default_termination_grace_period_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            liveness_sweep_interval_secs: default_liveness_sweep_interval_secs(),
            executor_max_passes: default_executor_max_passes(),
            flows_dir: None,
        }
    }
}
