//! Service liveness: registration, heartbeats and the sweep that marks
//! silent instances disconnected and later forcibly terminated.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use runway_core::models::{LivenessConfig, ServerInfo, ServiceInstance, ServiceState, ServiceType};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, AppResult};
use crate::queue::PollerPool;
use crate::repository::ServiceInstanceRepository;
use crate::result_ext::ResultExt;

pub struct LivenessService {
    repository: Arc<dyn ServiceInstanceRepository>,
    config: LivenessConfig,
}

impl LivenessService {
    pub fn new(repository: Arc<dyn ServiceInstanceRepository>, config: LivenessConfig) -> Self {
        Self { repository, config }
    }

    /// Store a new instance and move it to RUNNING.
    pub async fn register(
        &self,
        service_type: ServiceType,
        server: ServerInfo,
    ) -> AppResult<ServiceInstance> {
        let now = Utc::now();
        let created = ServiceInstance::new(service_type, server, self.config.clone(), now);
        self.repository.save(&created).await?;

        let running = created.update_state(ServiceState::Running, now, Some("started"));
        self.repository.save(&running).await?;

        info!(
            service_id = %running.id,
            service_type = service_type.as_str(),
            hostname = %running.server.hostname,
            "Service registered"
        );
        Ok(running)
    }

    /// Refresh `updated_at` of `instance`.
    ///
    /// When another process changed the stored copy meanwhile, the stored
    /// copy wins: a DISCONNECTED instance goes back to RUNNING, a terminated
    /// one is returned as is so the caller can stop.
    pub async fn heartbeat(
        &self,
        instance: &ServiceInstance,
        now: DateTime<Utc>,
    ) -> AppResult<ServiceInstance> {
        let beat = instance.heartbeat(now);
        match self.repository.save(&beat).await {
            Ok(()) => {
                debug!(service_id = %beat.id, seq_id = beat.seq_id, "Heartbeat");
                Ok(beat)
            }
            Err(AppError::Conflict(_)) => {
                let stored = self
                    .repository
                    .find_by_id(&instance.id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("service instance '{}'", instance.id)))?;

                if stored.is_state(ServiceState::Disconnected) {
                    let resumed =
                        stored.update_state(ServiceState::Running, now, Some("heartbeat resumed"));
                    self.repository.save(&resumed).await?;
                    warn!(service_id = %resumed.id, "Service reconnected after missed heartbeats");
                    return Ok(resumed);
                }
                Ok(stored)
            }
            Err(e) => Err(e),
        }
    }

    /// Move `instance` through TERMINATING to TERMINATED_GRACEFULLY.
    pub async fn deregister(&self, instance: &ServiceInstance) -> AppResult<ServiceInstance> {
        let now = Utc::now();
        let terminating = instance.update_state(ServiceState::Terminating, now, Some("shutdown"));
        self.repository.save(&terminating).await?;
        let terminated = terminating.update_state(ServiceState::TerminatedGracefully, now, None);
        self.repository.save(&terminated).await?;

        info!(service_id = %terminated.id, "Service deregistered");
        Ok(terminated)
    }

    /// Apply liveness timeouts. Returns the instances whose state changed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> AppResult<Vec<ServiceInstance>> {
        let mut changed = Vec::new();

        for instance in self.repository.find_all().await? {
            let next = match instance.state {
                ServiceState::Running if instance.is_session_timeout_elapsed(now) => Some((
                    ServiceState::Disconnected,
                    "liveness timeout elapsed",
                )),
                ServiceState::Disconnected | ServiceState::Terminating
                    if instance.is_termination_grace_period_elapsed(now) =>
                {
                    Some((ServiceState::TerminatedForced, "termination grace period elapsed"))
                }
                _ => None,
            };
            let Some((state, reason)) = next else {
                continue;
            };

            let updated = instance.update_state(state, now, Some(reason));
            match self.repository.save(&updated).await {
                Ok(()) => {
                    warn!(
                        service_id = %updated.id,
                        service_type = updated.service_type.as_str(),
                        from = %instance.state,
                        to = %state,
                        "Service state changed by liveness sweep"
                    );
                    changed.push(updated);
                }
                Err(AppError::Conflict(_)) => {
                    debug!(service_id = %instance.id, "Instance updated concurrently, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(changed)
    }

    /// Heartbeat `instance` every `interval`; deregister it on shutdown.
    pub fn start_heartbeat(
        self: Arc<Self>,
        instance: ServiceInstance,
        interval: Duration,
        pool: &PollerPool,
    ) -> JoinHandle<()> {
        let token = pool.child_token();
        pool.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            let mut current = instance;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.heartbeat(&current, Utc::now()).await {
                            Ok(next) if next.state.is_terminated() => {
                                error!(service_id = %next.id, state = %next.state, "Service was terminated, heartbeat stopped");
                                return;
                            }
                            Ok(next) => current = next,
                            Err(e) => warn!(service_id = %current.id, error = %e, "Heartbeat failed"),
                        }
                    }
                }
            }

            if let Err(e) = self.deregister(&current).await {
                warn!(service_id = %current.id, error = %e, "Failed to deregister service");
            }
        })
    }

    /// Run [`LivenessService::sweep`] every `interval`.
    pub fn start_sweeper(self: Arc<Self>, interval: Duration, pool: &PollerPool) {
        let token = pool.child_token();
        pool.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let _ = self.sweep(Utc::now()).await.log_warn("sweeping service instances");
                    }
                }
            }
        });
    }
}
