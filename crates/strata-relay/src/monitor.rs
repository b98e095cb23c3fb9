//! Self-healing monitor for the primary service.
//!
//! A supervised loop probes the primary's health endpoint. While healthy it
//! nudges the router back to PRIMARY; after three consecutive failures it
//! restarts the primary through the [`PrimaryAutoStart`] collaborator,
//! rate-limited by a cooldown and a lifetime attempt budget. Once the
//! budget is spent the monitor escalates: it forces the router to DIRECT
//! and stops trying.

use crate::gateway::HttpGateway;
use crate::router::{ReliabilityRouter, RouterMode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strata_core::config::env_u64;
use strata_core::Clock;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const CONSECUTIVE_FAILURES_TO_RESTART: u32 = 3;
const RESTART_SETTLE: Duration = Duration::from_secs(2);

/// Starts and stops the primary service process. Out-of-core collaborator.
#[async_trait]
pub trait PrimaryAutoStart: Send + Sync {
    async fn start(&self) -> bool;
    async fn stop(&self) -> bool;
}

/// Monitor configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | STRATA_MONITOR_CHECK_INTERVAL_SECS | 30 | Health probe period. |
/// | STRATA_MONITOR_RESTART_COOLDOWN_SECS | 120 | Min gap between restart attempts. |
/// | STRATA_MONITOR_MAX_RESTART_ATTEMPTS | 3 | Lifetime restart budget. |
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub check_interval_secs: u64,
    pub restart_cooldown_secs: u64,
    pub max_restart_attempts: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            restart_cooldown_secs: 120,
            max_restart_attempts: 3,
        }
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            check_interval_secs: env_u64("STRATA_MONITOR_CHECK_INTERVAL_SECS", d.check_interval_secs),
            restart_cooldown_secs: env_u64(
                "STRATA_MONITOR_RESTART_COOLDOWN_SECS",
                d.restart_cooldown_secs,
            ),
            max_restart_attempts: env_u64(
                "STRATA_MONITOR_MAX_RESTART_ATTEMPTS",
                d.max_restart_attempts,
            ),
        }
    }
}

#[derive(Debug, Default)]
struct MonitorMetrics {
    total_checks: AtomicU64,
    health_checks_passed: AtomicU64,
    health_checks_failed: AtomicU64,
    auto_restarts: AtomicU64,
    restart_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitorMetricsSnapshot {
    pub total_checks: u64,
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    pub auto_restarts: u64,
    pub restart_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub health_percentage: f64,
    pub auto_restarts: u64,
    pub escalated: bool,
}

pub struct SelfHealingMonitor {
    config: MonitorConfig,
    router: Arc<ReliabilityRouter>,
    auto_start: Arc<dyn PrimaryAutoStart>,
    gateway: Arc<dyn HttpGateway>,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    consecutive_failures: AtomicU32,
    last_restart: Mutex<Option<Instant>>,
    escalated: AtomicBool,
    metrics: MonitorMetrics,
}

impl SelfHealingMonitor {
    pub fn new(
        config: MonitorConfig,
        router: Arc<ReliabilityRouter>,
        auto_start: Arc<dyn PrimaryAutoStart>,
        gateway: Arc<dyn HttpGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            router,
            auto_start,
            gateway,
            clock,
            running: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_restart: Mutex::new(None),
            escalated: AtomicBool::new(false),
            metrics: MonitorMetrics::default(),
        }
    }

    /// Spawn the monitor loop. Errors inside a cycle are logged; the loop
    /// never exits on a bad tick, only via [`Self::stop`].
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            tracing::info!(target: "strata::monitor", "self-healing monitor started");
            let interval = Duration::from_secs(monitor.config.check_interval_secs);
            while monitor.running.load(Ordering::SeqCst) {
                monitor.check_cycle().await;
                monitor.clock.sleep(interval).await;
            }
            tracing::info!(target: "strata::monitor", "self-healing monitor stopped");
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One probe cycle. Public so tests (and operators) can drive it
    /// directly.
    pub async fn check_cycle(&self) {
        self.metrics.total_checks.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}/health", self.router.primary_url());
        let healthy = self.gateway.get_ok(&url, HEALTH_TIMEOUT).await;

        if healthy {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.metrics
                .health_checks_passed
                .fetch_add(1, Ordering::Relaxed);
            self.router.check_health_and_recover().await;
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics
            .health_checks_failed
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            target: "strata::monitor",
            consecutive = failures,
            "primary health check failed"
        );
        if failures >= CONSECUTIVE_FAILURES_TO_RESTART {
            self.attempt_restart().await;
        }
    }

    async fn attempt_restart(&self) {
        if self.escalated.load(Ordering::SeqCst) {
            return;
        }

        // Rate limit: one attempt per cooldown window.
        {
            let last = self.last_restart.lock().unwrap();
            if let Some(last) = *last {
                let since = self.clock.monotonic().duration_since(last);
                let cooldown = Duration::from_secs(self.config.restart_cooldown_secs);
                if since < cooldown {
                    tracing::warn!(
                        target: "strata::monitor",
                        remaining_secs = (cooldown - since).as_secs(),
                        "restart cooldown active"
                    );
                    return;
                }
            }
        }

        // Lifetime budget: once spent, escalate to DIRECT and stop trying.
        if self.metrics.auto_restarts.load(Ordering::Relaxed) >= self.config.max_restart_attempts {
            tracing::error!(
                target: "strata::monitor",
                max = self.config.max_restart_attempts,
                "max restart attempts reached, escalating to direct mode"
            );
            self.router.force_mode(RouterMode::Direct);
            self.escalated.store(true, Ordering::SeqCst);
            return;
        }

        tracing::info!(target: "strata::monitor", "attempting primary auto-restart");
        self.auto_start.stop().await;
        self.clock.sleep(RESTART_SETTLE).await;
        let started = self.auto_start.start().await;
        *self.last_restart.lock().unwrap() = Some(self.clock.monotonic());

        if started {
            self.metrics.auto_restarts.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::SeqCst);
            tracing::info!(target: "strata::monitor", "primary restarted");
        } else {
            self.metrics.restart_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(target: "strata::monitor", "primary restart failed");
        }
    }

    pub fn metrics(&self) -> MonitorMetricsSnapshot {
        MonitorMetricsSnapshot {
            total_checks: self.metrics.total_checks.load(Ordering::Relaxed),
            health_checks_passed: self.metrics.health_checks_passed.load(Ordering::Relaxed),
            health_checks_failed: self.metrics.health_checks_failed.load(Ordering::Relaxed),
            auto_restarts: self.metrics.auto_restarts.load(Ordering::Relaxed),
            restart_failures: self.metrics.restart_failures.load(Ordering::Relaxed),
        }
    }

    pub fn health_status(&self) -> MonitorHealth {
        let metrics = self.metrics();
        let consecutive = self.consecutive_failures.load(Ordering::SeqCst);
        let health_percentage = if metrics.total_checks > 0 {
            metrics.health_checks_passed as f64 / metrics.total_checks as f64 * 100.0
        } else {
            0.0
        };
        MonitorHealth {
            healthy: consecutive == 0,
            consecutive_failures: consecutive,
            health_percentage,
            auto_restarts: metrics.auto_restarts,
            escalated: self.escalated.load(Ordering::SeqCst),
        }
    }
}
