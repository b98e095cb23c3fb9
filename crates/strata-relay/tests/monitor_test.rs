//! Self-healing monitor: restart after consecutive failures, restart
//! cooldown, escalation to direct mode once the budget is spent.

mod common;

use async_trait::async_trait;
use common::ScriptedGateway;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strata_core::ManualClock;
use strata_relay::{
    MonitorConfig, PrimaryAutoStart, ReliabilityRouter, RouterConfig, RouterMode,
    SelfHealingMonitor,
};

#[derive(Default)]
struct FakeAutoStart {
    starts: AtomicU32,
    stops: AtomicU32,
    start_succeeds: AtomicBool,
}

impl FakeAutoStart {
    fn new(start_succeeds: bool) -> Arc<Self> {
        let fake = Self::default();
        fake.start_succeeds.store(start_succeeds, Ordering::SeqCst);
        Arc::new(fake)
    }
}

#[async_trait]
impl PrimaryAutoStart for FakeAutoStart {
    async fn start(&self) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.start_succeeds.load(Ordering::SeqCst)
    }

    async fn stop(&self) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        true
    }
}

fn harness(
    config: MonitorConfig,
    auto_start: Arc<FakeAutoStart>,
) -> (Arc<ScriptedGateway>, Arc<ManualClock>, Arc<ReliabilityRouter>, SelfHealingMonitor) {
    let gateway = Arc::new(ScriptedGateway::new());
    let clock = Arc::new(ManualClock::starting_now());
    let router = Arc::new(ReliabilityRouter::new(
        RouterConfig::default(),
        gateway.clone(),
        clock.clone(),
    ));
    let monitor = SelfHealingMonitor::new(
        config,
        router.clone(),
        auto_start,
        gateway.clone(),
        clock.clone(),
    );
    (gateway, clock, router, monitor)
}

#[tokio::test]
async fn healthy_cycles_keep_counters_clean() {
    let auto_start = FakeAutoStart::new(true);
    let (gateway, _clock, _router, monitor) =
        harness(MonitorConfig::default(), auto_start.clone());
    gateway.set_healthy(true);

    for _ in 0..5 {
        monitor.check_cycle().await;
    }
    let health = monitor.health_status();
    assert!(health.healthy);
    assert_eq!(health.health_percentage, 100.0);
    assert_eq!(auto_start.starts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn three_failures_trigger_one_restart() {
    let auto_start = FakeAutoStart::new(true);
    let (gateway, _clock, _router, monitor) =
        harness(MonitorConfig::default(), auto_start.clone());
    gateway.set_healthy(false);

    monitor.check_cycle().await;
    monitor.check_cycle().await;
    assert_eq!(auto_start.starts.load(Ordering::SeqCst), 0);

    monitor.check_cycle().await;
    assert_eq!(auto_start.stops.load(Ordering::SeqCst), 1);
    assert_eq!(auto_start.starts.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.metrics().auto_restarts, 1);
    // Successful restart clears the failure streak.
    assert!(monitor.health_status().healthy);
}

#[tokio::test]
async fn restart_cooldown_blocks_back_to_back_attempts() {
    let auto_start = FakeAutoStart::new(true);
    let config = MonitorConfig {
        restart_cooldown_secs: 120,
        max_restart_attempts: 5,
        ..MonitorConfig::default()
    };
    let (gateway, clock, _router, monitor) = harness(config, auto_start.clone());
    gateway.set_healthy(false);

    for _ in 0..3 {
        monitor.check_cycle().await;
    }
    assert_eq!(auto_start.starts.load(Ordering::SeqCst), 1);

    // Still unhealthy, but within the cooldown window: no new attempt.
    for _ in 0..3 {
        monitor.check_cycle().await;
    }
    assert_eq!(auto_start.starts.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(121));
    for _ in 0..3 {
        monitor.check_cycle().await;
    }
    assert_eq!(auto_start.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn spent_budget_escalates_to_direct_and_stops_trying() {
    let auto_start = FakeAutoStart::new(true);
    let config = MonitorConfig {
        restart_cooldown_secs: 1,
        max_restart_attempts: 1,
        ..MonitorConfig::default()
    };
    let (gateway, clock, router, monitor) = harness(config, auto_start.clone());
    gateway.set_healthy(false);

    for _ in 0..3 {
        monitor.check_cycle().await;
    }
    assert_eq!(monitor.metrics().auto_restarts, 1);

    // Budget spent: the next eligible attempt escalates instead.
    clock.advance(Duration::from_secs(2));
    for _ in 0..3 {
        monitor.check_cycle().await;
    }
    assert_eq!(auto_start.starts.load(Ordering::SeqCst), 1);
    assert!(monitor.health_status().escalated);
    assert_eq!(router.snapshot().mode, RouterMode::Direct);

    // Escalated: further failures never restart again.
    clock.advance(Duration::from_secs(10));
    for _ in 0..3 {
        monitor.check_cycle().await;
    }
    assert_eq!(auto_start.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_restart_counts_but_does_not_reset_streak() {
    let auto_start = FakeAutoStart::new(false);
    let (gateway, _clock, _router, monitor) =
        harness(MonitorConfig::default(), auto_start.clone());
    gateway.set_healthy(false);

    for _ in 0..3 {
        monitor.check_cycle().await;
    }
    let metrics = monitor.metrics();
    assert_eq!(metrics.auto_restarts, 0);
    assert_eq!(metrics.restart_failures, 1);
    assert!(!monitor.health_status().healthy);
}

#[tokio::test]
async fn recovery_resets_failures_and_nudges_router() {
    let auto_start = FakeAutoStart::new(true);
    let (gateway, _clock, router, monitor) =
        harness(MonitorConfig::default(), auto_start);
    router.force_mode(RouterMode::Direct);

    gateway.set_healthy(false);
    monitor.check_cycle().await;
    assert_eq!(monitor.health_status().consecutive_failures, 1);

    gateway.set_healthy(true);
    monitor.check_cycle().await;
    assert_eq!(monitor.health_status().consecutive_failures, 0);
    // The healthy cycle asked the router to recover; with the circuit
    // closed (forced mode) it returns to primary immediately.
    assert_eq!(router.snapshot().mode, RouterMode::Primary);
}
