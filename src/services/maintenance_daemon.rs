//! Maintenance background daemon.
//!
//! Runs the periodic housekeeping the core components need:
//! - Releasing conversation locks whose TTL lapsed
//! - Dropping expired conversation rotation records
//! - Pruning trace nodes past retention
//! - Evicting terminal completion requests past retention
//! - Pruning idle chain breakers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::completion_orchestrator::CompletionOrchestrator;
use super::conversation_locks::ConversationLockManager;
use super::correlation_tracer::CorrelationTracer;
use super::injection_router::InjectionRouter;
use crate::domain::models::Config;

/// Configuration for the maintenance daemon.
#[derive(Debug, Clone)]
pub struct MaintenanceDaemonConfig {
    /// Interval between maintenance runs.
    pub interval: Duration,
    /// Whether to run once immediately on start.
    pub run_on_startup: bool,
    pub trace_retention: chrono::Duration,
    pub terminal_retention: chrono::Duration,
}

impl Default for MaintenanceDaemonConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for MaintenanceDaemonConfig {
    fn from(config: &Config) -> Self {
        let secs = |s: u64| chrono::Duration::seconds(i64::try_from(s).unwrap_or(i64::MAX));
        Self {
            interval: Duration::from_secs(config.maintenance.interval_secs.max(1)),
            run_on_startup: false,
            trace_retention: secs(config.tracer.retention_secs),
            terminal_retention: secs(config.orchestrator.terminal_retention_secs),
        }
    }
}

impl MaintenanceDaemonConfig {
    /// Create config for frequent maintenance (testing).
    pub fn frequent() -> Self {
        Self {
            interval: Duration::from_millis(100),
            run_on_startup: true,
            ..Default::default()
        }
    }
}

/// What one maintenance run cleaned up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub stale_locks: usize,
    pub rotations_pruned: usize,
    pub traces_pruned: usize,
    pub requests_evicted: usize,
    pub breakers_pruned: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Status of the maintenance daemon.
#[derive(Debug, Clone, Default)]
pub struct DaemonStatus {
    /// Whether the daemon is running.
    pub running: bool,
    /// Total maintenance runs.
    pub total_runs: u64,
    /// Last run time.
    pub last_run: Option<Instant>,
    /// Report of the last run.
    pub last_report: Option<MaintenanceReport>,
    pub total_stale_locks: u64,
    pub total_evicted: u64,
}

/// Handle to control the maintenance daemon.
#[derive(Clone)]
pub struct DaemonHandle {
    stop_flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
    status: Arc<RwLock<DaemonStatus>>,
}

impl DaemonHandle {
    /// Request the daemon to stop.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Check if stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Get current daemon status.
    pub async fn status(&self) -> DaemonStatus {
        self.status.read().await.clone()
    }
}

/// Maintenance background daemon.
pub struct MaintenanceDaemon {
    orchestrator: Arc<CompletionOrchestrator>,
    locks: Arc<ConversationLockManager>,
    injection: Arc<InjectionRouter>,
    tracer: Arc<CorrelationTracer>,
    config: MaintenanceDaemonConfig,
    status: Arc<RwLock<DaemonStatus>>,
    stop_flag: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl MaintenanceDaemon {
    pub fn new(
        orchestrator: Arc<CompletionOrchestrator>,
        locks: Arc<ConversationLockManager>,
        injection: Arc<InjectionRouter>,
        tracer: Arc<CorrelationTracer>,
        config: MaintenanceDaemonConfig,
    ) -> Self {
        Self {
            orchestrator,
            locks,
            injection,
            tracer,
            config,
            status: Arc::new(RwLock::new(DaemonStatus::default())),
            stop_flag: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to control the daemon.
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            stop_flag: self.stop_flag.clone(),
            wake: self.wake.clone(),
            status: self.status.clone(),
        }
    }

    /// Spawn the daemon loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run_loop())
    }

    async fn run_loop(self) {
        self.status.write().await.running = true;
        info!(interval_ms = self.config.interval.as_millis() as u64, "maintenance daemon started");

        let mut timer = interval(self.config.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        timer.tick().await;

        if self.config.run_on_startup {
            self.run_once().await;
        }

        while !self.stop_flag.load(Ordering::Acquire) {
            tokio::select! {
                _ = timer.tick() => {}
                () = self.wake.notified() => {}
            }
            if self.stop_flag.load(Ordering::Acquire) {
                break;
            }
            self.run_once().await;
        }

        self.status.write().await.running = false;
        info!("maintenance daemon stopped");
    }

    /// Run a single maintenance cycle.
    pub async fn run_once(&self) -> MaintenanceReport {
        let started = Instant::now();
        let report = MaintenanceReport {
            stale_locks: self.locks.sweep_expired().await.len(),
            rotations_pruned: self.locks.prune_rotations(),
            traces_pruned: self.tracer.cleanup(self.config.trace_retention),
            requests_evicted: self.orchestrator.evict_terminal(self.config.terminal_retention),
            breakers_pruned: self.injection.prune_breakers(),
        };

        {
            let mut status = self.status.write().await;
            status.total_runs += 1;
            status.last_run = Some(Instant::now());
            status.total_stale_locks += report.stale_locks as u64;
            status.total_evicted += report.requests_evicted as u64;
            status.last_report = Some(report.clone());
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        if report.is_empty() {
            debug!(duration_ms, "maintenance run found nothing to do");
        } else {
            info!(
                stale_locks = report.stale_locks,
                rotations_pruned = report.rotations_pruned,
                traces_pruned = report.traces_pruned,
                requests_evicted = report.requests_evicted,
                breakers_pruned = report.breakers_pruned,
                duration_ms,
                "maintenance run completed"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::providers::mock::MockProvider;
    use crate::domain::models::{
        InjectionConfig, LocksConfig, OrchestratorConfig, RequestId, RouterConfig, TracerConfig,
    };
    use crate::services::event_router::EventRouter;
    use serde_json::Value;

    fn daemon(locks_config: LocksConfig, config: MaintenanceDaemonConfig) -> (MaintenanceDaemon, Arc<ConversationLockManager>) {
        let tracer = Arc::new(CorrelationTracer::new(&TracerConfig::default()).unwrap());
        let router = Arc::new(EventRouter::new(tracer.clone(), &RouterConfig::default()));
        let locks = Arc::new(ConversationLockManager::new(locks_config).with_router(router.clone()));
        let orchestrator = Arc::new(CompletionOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(MockProvider::new()),
            router.clone(),
            locks.clone(),
        ));
        let injection = Arc::new(InjectionRouter::new(InjectionConfig::default(), router));
        (
            MaintenanceDaemon::new(orchestrator, locks.clone(), injection, tracer, config),
            locks,
        )
    }

    #[tokio::test]
    async fn test_run_once_releases_expired_locks() {
        let (daemon, locks) = daemon(
            LocksConfig {
                ttl_ms: 1,
                ..Default::default()
            },
            MaintenanceDaemonConfig::default(),
        );
        locks.acquire("c1", &RequestId::from("r1"), Value::Null).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = daemon.run_once().await;
        assert_eq!(report.stale_locks, 1);
        assert_eq!(locks.lock_count(), 0);

        let status = daemon.handle().status().await;
        assert_eq!(status.total_runs, 1);
        assert_eq!(status.total_stale_locks, 1);
    }

    #[tokio::test]
    async fn test_handle_stops_loop() {
        let (daemon, _locks) = daemon(LocksConfig::default(), MaintenanceDaemonConfig::frequent());
        let handle = daemon.handle();
        let task = daemon.spawn();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(handle.status().await.running);
        assert!(handle.status().await.total_runs >= 1);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("daemon should stop")
            .unwrap();
        assert!(!handle.status().await.running);
        assert!(handle.is_stop_requested());
    }
}
