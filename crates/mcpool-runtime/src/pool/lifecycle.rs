//! Periodic eviction of idle and over-age instances
//!
//! Each sweep collects idle instances (no sessions, unused past the idle
//! timeout) and expired ones (older than the max lifetime), terminates them
//! concurrently through an [`InstanceTerminator`] bounded by the termination
//! timeout, and removes every one of them from the registry whatever the
//! terminator did. A failed or timed-out termination may leave an OS process
//! behind; that is logged as its own warning.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mcpool_core::{InstanceState, LifecycleSettings, PoolResult, PoolStats};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::instance::McpInstance;
use super::registry::InstanceRegistry;

/// Tears down the transport behind an instance.
#[async_trait]
pub trait InstanceTerminator: Send + Sync {
    async fn terminate(&self, instance: &McpInstance) -> PoolResult<()>;
}

/// Liveness check for an instance.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &McpInstance) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    /// Every instance removed from the registry
    pub evicted: Vec<String>,
    /// Removed, but the terminator returned an error
    pub failed: Vec<String>,
    /// Removed, but the terminator did not finish in time
    pub timed_out: Vec<String>,
}

enum Termination {
    Clean,
    Failed,
    TimedOut,
}

/// Terminate `instances` concurrently and remove each from the registry.
///
/// Removal happens whether termination succeeds, fails or times out.
pub async fn evict_instances(
    registry: &InstanceRegistry,
    terminator: &dyn InstanceTerminator,
    instances: Vec<Arc<McpInstance>>,
    limit: Duration,
) -> EvictionReport {
    let outcomes = join_all(instances.into_iter().map(|instance| async move {
        instance.transition(InstanceState::Terminated);
        let outcome = match tokio::time::timeout(limit, terminator.terminate(&instance)).await {
            Ok(Ok(())) => Termination::Clean,
            Ok(Err(e)) => {
                warn!(
                    instance_id = %instance.instance_id(),
                    connection = ?instance.connection(),
                    error = %e,
                    "[Lifecycle] Termination failed, provider process may be orphaned"
                );
                Termination::Failed
            }
            Err(_) => {
                warn!(
                    instance_id = %instance.instance_id(),
                    connection = ?instance.connection(),
                    timeout_ms = limit.as_millis() as u64,
                    "[Lifecycle] Termination timed out, provider process may be orphaned"
                );
                Termination::TimedOut
            }
        };
        registry.remove(instance.instance_id());
        (instance.instance_id().to_string(), outcome)
    }))
    .await;

    let mut report = EvictionReport::default();
    for (instance_id, outcome) in outcomes {
        match outcome {
            Termination::Clean => {}
            Termination::Failed => report.failed.push(instance_id.clone()),
            Termination::TimedOut => report.timed_out.push(instance_id.clone()),
        }
        report.evicted.push(instance_id);
    }
    report
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub idle: Vec<String>,
    pub expired: Vec<String>,
    pub evicted: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthIssue {
    pub instance_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub auto_terminated: Vec<String>,
    pub issues: Vec<HealthIssue>,
}

/// Partial settings change for [`LifecycleManager::update_config`].
#[derive(Debug, Clone, Default)]
pub struct LifecycleUpdate {
    pub check_interval: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub termination_timeout: Option<Duration>,
    pub health_check_timeout: Option<Duration>,
    pub auto_cleanup: Option<bool>,
    pub auto_terminate_unhealthy: Option<bool>,
}

impl LifecycleUpdate {
    fn apply(self, settings: &mut LifecycleSettings) {
        match self.check_interval {
            Some(v) if v.is_zero() => {
                warn!("[Lifecycle] Ignoring zero check interval");
            }
            Some(v) => settings.check_interval = v,
            None => {}
        }
        if let Some(v) = self.idle_timeout {
            settings.idle_timeout = v;
        }
        if let Some(v) = self.max_lifetime {
            settings.max_lifetime = v;
        }
        if let Some(v) = self.termination_timeout {
            settings.termination_timeout = v;
        }
        if let Some(v) = self.health_check_timeout {
            settings.health_check_timeout = v;
        }
        if let Some(v) = self.auto_cleanup {
            settings.auto_cleanup = v;
        }
        if let Some(v) = self.auto_terminate_unhealthy {
            settings.auto_terminate_unhealthy = v;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleStats {
    pub running: bool,
    pub settings: LifecycleSettings,
    pub sweeps: u64,
    pub total_evicted: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_report: Option<CleanupReport>,
    pub pool: PoolStats,
}

#[derive(Debug, Default)]
struct SweepHistory {
    sweeps: u64,
    total_evicted: u64,
    last_sweep_at: Option<DateTime<Utc>>,
    last_report: Option<CleanupReport>,
}

struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct LifecycleManager {
    registry: Arc<InstanceRegistry>,
    terminator: Arc<dyn InstanceTerminator>,
    health_probe: Option<Arc<dyn HealthProbe>>,
    settings: RwLock<LifecycleSettings>,
    worker: Mutex<Option<Worker>>,
    history: Mutex<SweepHistory>,
}

impl LifecycleManager {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        terminator: Arc<dyn InstanceTerminator>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            terminator,
            health_probe: None,
            settings: RwLock::new(settings),
            worker: Mutex::new(None),
            history: Mutex::new(SweepHistory::default()),
        }
    }

    pub fn with_health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.health_probe = Some(probe);
        self
    }

    pub fn settings(&self) -> LifecycleSettings {
        self.settings.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.task.is_finished())
    }

    /// Start the periodic sweep. No-op when already running or when
    /// `auto_cleanup` is off. The first sweep runs immediately.
    pub fn start(self: &Arc<Self>) {
        let settings = self.settings();
        if !settings.auto_cleanup {
            info!("[Lifecycle] Automatic cleanup disabled");
            return;
        }

        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let every = if settings.check_interval.is_zero() {
            let fallback = LifecycleSettings::default().check_interval;
            warn!(
                fallback_ms = fallback.as_millis() as u64,
                "[Lifecycle] Zero check interval, using default"
            );
            fallback
        } else {
            settings.check_interval
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(sweep_loop(Arc::downgrade(self), cancel.clone(), every));
        *worker = Some(Worker { cancel, task });

        info!(
            interval_ms = every.as_millis() as u64,
            idle_timeout_ms = settings.idle_timeout.as_millis() as u64,
            max_lifetime_ms = settings.max_lifetime.as_millis() as u64,
            "[Lifecycle] Started"
        );
    }

    /// Stop the periodic sweep. A sweep already in progress finishes.
    pub fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.cancel.cancel();
            info!("[Lifecycle] Stopped");
        }
    }

    /// Apply new settings; a running timer restarts with them.
    pub fn update_config(self: &Arc<Self>, update: LifecycleUpdate) {
        update.apply(&mut self.settings.write());
        info!(settings = ?self.settings(), "[Lifecycle] Configuration updated");
        if self.is_running() {
            self.stop();
            self.start();
        }
    }

    /// One sweep over idle and expired instances.
    pub async fn run_cleanup_now(&self) -> CleanupReport {
        let settings = self.settings();
        let idle = self.registry.get_idle_instances(settings.idle_timeout);
        let expired = self.registry.get_old_instances(settings.max_lifetime);

        let mut report = CleanupReport {
            idle: idle.iter().map(|i| i.instance_id().to_string()).collect(),
            expired: expired.iter().map(|i| i.instance_id().to_string()).collect(),
            ..Default::default()
        };

        let mut seen = HashSet::new();
        let candidates: Vec<_> = idle
            .into_iter()
            .chain(expired)
            .filter(|instance| seen.insert(instance.instance_id().to_string()))
            .collect();

        if candidates.is_empty() {
            debug!("[Lifecycle] Sweep found nothing to evict");
        } else {
            info!(
                idle = report.idle.len(),
                expired = report.expired.len(),
                "[Lifecycle] Evicting instances"
            );
            let eviction = evict_instances(
                &self.registry,
                self.terminator.as_ref(),
                candidates,
                settings.termination_timeout,
            )
            .await;
            report.evicted = eviction.evicted;
            report.failed = eviction.failed;
            report.timed_out = eviction.timed_out;
        }

        let mut history = self.history.lock();
        history.sweeps += 1;
        history.total_evicted += report.evicted.len() as u64;
        history.last_sweep_at = Some(Utc::now());
        history.last_report = Some(report.clone());
        report
    }

    /// Probe every available instance; optionally evict the unhealthy ones.
    pub async fn perform_health_check(&self) -> HealthReport {
        let Some(probe) = self.health_probe.as_deref() else {
            return HealthReport::default();
        };
        let settings = self.settings();
        let instances = self.registry.available_instances();
        let limit = settings.health_check_timeout;

        let results = join_all(instances.iter().map(|instance| async move {
            let verdict = tokio::time::timeout(limit, probe.probe(instance)).await;
            (instance.clone(), verdict)
        }))
        .await;

        let mut report = HealthReport {
            total: results.len(),
            ..Default::default()
        };
        let mut unhealthy = Vec::new();
        for (instance, verdict) in results {
            let reason = match verdict {
                Ok(true) => {
                    report.healthy += 1;
                    continue;
                }
                Ok(false) => "health probe failed".to_string(),
                Err(_) => format!("health probe timed out after {}ms", limit.as_millis()),
            };
            warn!(
                instance_id = %instance.instance_id(),
                reason = %reason,
                "[Lifecycle] Unhealthy instance"
            );
            report.issues.push(HealthIssue {
                instance_id: instance.instance_id().to_string(),
                reason,
            });
            unhealthy.push(instance);
        }
        report.unhealthy = unhealthy.len();

        if settings.auto_terminate_unhealthy && !unhealthy.is_empty() {
            for instance in &unhealthy {
                instance.transition(InstanceState::Failed);
            }
            let eviction = evict_instances(
                &self.registry,
                self.terminator.as_ref(),
                unhealthy,
                settings.termination_timeout,
            )
            .await;
            report.auto_terminated = eviction.evicted;
        }
        report
    }

    pub fn stats(&self) -> LifecycleStats {
        let history = self.history.lock();
        LifecycleStats {
            running: self.is_running(),
            settings: self.settings(),
            sweeps: history.sweeps,
            total_evicted: history.total_evicted,
            last_sweep_at: history.last_sweep_at,
            last_report: history.last_report.clone(),
            pool: self.registry.get_stats(),
        }
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.cancel.cancel();
        }
    }
}

async fn sweep_loop(manager: Weak<LifecycleManager>, cancel: CancellationToken, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let Some(manager) = manager.upgrade() else { break };
                manager.run_cleanup_now().await;
                if manager.settings().auto_terminate_unhealthy {
                    manager.perform_health_check().await;
                }
            }
        }
    }
    debug!("[Lifecycle] Sweep loop exited");
}
