//! Liveness records of executor, worker and scheduler processes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::models::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Executor,
    Worker,
    Scheduler,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Executor => "EXECUTOR",
            Self::Worker => "WORKER",
            Self::Scheduler => "SCHEDULER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Created,
    Running,
    Disconnected,
    Terminating,
    TerminatedGracefully,
    TerminatedForced,
    NotRunning,
    Empty,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Disconnected => "DISCONNECTED",
            Self::Terminating => "TERMINATING",
            Self::TerminatedGracefully => "TERMINATED_GRACEFULLY",
            Self::TerminatedForced => "TERMINATED_FORCED",
            Self::NotRunning => "NOT_RUNNING",
            Self::Empty => "EMPTY",
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            Self::TerminatedGracefully | Self::TerminatedForced | Self::NotRunning | Self::Empty
        )
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub hostname: String,
    pub version: String,
}

impl ServerInfo {
    /// Descriptor of the current process.
    pub fn current(id: &str) -> Self {
        Self {
            id: id.to_string(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub ts: DateTime<Utc>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessConfig {
    pub liveness_timeout_secs: u64,
    pub termination_grace_period_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_secs: 60,
            termination_grace_period_secs: 300,
        }
    }
}

/// Liveness record of one running service.
///
/// `seq_id` grows on every update; stores reject writes that do not
/// increase it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub state: ServiceState,
    pub server: ServerInfo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub events: Vec<ServiceEvent>,
    pub config: LivenessConfig,
    #[serde(default)]
    pub props: Map<String, serde_json::Value>,
    pub seq_id: i64,
}

impl ServiceInstance {
    pub fn new(
        service_type: ServiceType,
        server: ServerInfo,
        config: LivenessConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            service_type,
            state: ServiceState::Created,
            server,
            created_at: now,
            updated_at: now,
            events: Vec::new(),
            config,
            props: Map::new(),
            seq_id: 0,
        }
    }

    /// Move to `state`, logging `reason` in the event list when given.
    pub fn update_state(
        &self,
        state: ServiceState,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Self {
        let mut events = self.events.clone();
        if let Some(reason) = reason {
            events.push(ServiceEvent {
                ts: at,
                value: format!("{} -> {}: {}", self.state, state, reason),
            });
        }
        Self {
            state,
            updated_at: at,
            events,
            seq_id: self.seq_id + 1,
            ..self.clone()
        }
    }

    /// Refresh `updated_at` without changing state.
    pub fn heartbeat(&self, at: DateTime<Utc>) -> Self {
        Self {
            updated_at: at,
            seq_id: self.seq_id + 1,
            ..self.clone()
        }
    }

    pub fn is_session_timeout_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.updated_at + secs(self.config.liveness_timeout_secs) < now
    }

    pub fn is_termination_grace_period_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.updated_at + secs(self.config.termination_grace_period_secs) < now
    }

    pub fn is_type(&self, service_type: ServiceType) -> bool {
        self.service_type == service_type
    }

    pub fn is_state(&self, state: ServiceState) -> bool {
        self.state == state
    }
}

fn secs(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}
