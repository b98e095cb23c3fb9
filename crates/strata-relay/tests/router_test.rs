//! Router failover behavior: circuit opening, key rotation, cooldown
//! probe and recovery.

mod common;

use common::ScriptedGateway;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use strata_core::ManualClock;
use strata_relay::{AiRequest, ReliabilityRouter, RouterConfig, RouterError, RouterMode};

const PRIMARY: &str = "http://primary.test";
const DEEPSEEK: &str = "https://api.deepseek.test";

fn config() -> RouterConfig {
    let mut config = RouterConfig {
        primary_url: PRIMARY.to_string(),
        max_failures: 3,
        circuit_timeout_secs: 2,
        ..RouterConfig::default()
    };
    config.services.get_mut("deepseek").unwrap().upstream_url =
        format!("{}/v1/chat/completions", DEEPSEEK);
    config
}

fn upstream_ok(content: &str) -> serde_json::Value {
    json!({
        "choices": [{"message": {"content": content}}],
        "model": "deepseek-chat",
        "usage": {"total_tokens": 10},
    })
}

fn request() -> AiRequest {
    AiRequest {
        service: "deepseek".to_string(),
        query: "classify regime".to_string(),
        max_tokens: None,
        temperature: None,
    }
}

fn harness() -> (Arc<ScriptedGateway>, Arc<ManualClock>, ReliabilityRouter) {
    let gateway = Arc::new(ScriptedGateway::new());
    let clock = Arc::new(ManualClock::starting_now());
    let router = ReliabilityRouter::new(config(), gateway.clone(), clock.clone());
    (gateway, clock, router)
}

#[tokio::test]
async fn primary_success_stays_primary() {
    let (gateway, _clock, router) = harness();
    gateway.queue(
        PRIMARY,
        Ok(json!({"content": "fine", "model": "aggregate", "usage": {}})),
    );

    let response = router.send(&request()).await.unwrap();
    assert_eq!(response.source, "primary");
    assert_eq!(response.content, "fine");
    let snapshot = router.snapshot();
    assert_eq!(snapshot.mode, RouterMode::Primary);
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.metrics.primary_requests, 1);
}

#[tokio::test]
async fn three_primary_failures_open_the_circuit() {
    let (gateway, _clock, router) = harness();
    router.add_key("deepseek", "key-0");
    router.add_key("deepseek", "key-1");
    for _ in 0..3 {
        gateway.queue_err(PRIMARY, "connection refused");
    }
    for i in 0..4 {
        gateway.queue(DEEPSEEK, Ok(upstream_ok(&format!("direct-{i}"))));
    }

    // Each failing primary call falls back to direct within the same call.
    for _ in 0..3 {
        let response = router.send(&request()).await.unwrap();
        assert_eq!(response.source, "direct");
    }
    let snapshot = router.snapshot();
    assert_eq!(snapshot.mode, RouterMode::Direct);
    assert!(snapshot.circuit_open);
    assert_eq!(snapshot.metrics.circuit_opens, 1);
    assert_eq!(snapshot.metrics.primary_failures, 3);

    // Circuit open: the next call goes direct without touching the primary.
    router.send(&request()).await.unwrap();
    assert_eq!(gateway.calls_to(PRIMARY).len(), 3);
}

#[tokio::test]
async fn direct_mode_rotates_keys_in_ring_order() {
    let (gateway, _clock, router) = harness();
    router.add_key("deepseek", "key-0");
    router.add_key("deepseek", "key-1");
    router.force_mode(RouterMode::Direct);
    for i in 0..3 {
        gateway.queue(DEEPSEEK, Ok(upstream_ok(&format!("r{i}"))));
    }

    for _ in 0..3 {
        let response = router.send(&request()).await.unwrap();
        assert_eq!(response.source, "direct");
        assert_eq!(response.model, "deepseek-chat");
    }

    let bearers: Vec<Option<String>> = gateway
        .calls_to(DEEPSEEK)
        .into_iter()
        .map(|c| c.bearer)
        .collect();
    assert_eq!(
        bearers,
        vec![
            Some("key-0".to_string()),
            Some("key-1".to_string()),
            Some("key-0".to_string()),
        ]
    );
}

#[tokio::test]
async fn failing_key_is_skipped_and_rotation_advances_past_winner() {
    let (gateway, _clock, router) = harness();
    router.add_key("deepseek", "key-0");
    router.add_key("deepseek", "key-1");
    router.force_mode(RouterMode::Direct);

    gateway.queue_err(DEEPSEEK, "401 bad key");
    gateway.queue(DEEPSEEK, Ok(upstream_ok("from key-1")));
    gateway.queue(DEEPSEEK, Ok(upstream_ok("from key-0")));

    let response = router.send(&request()).await.unwrap();
    assert_eq!(response.content, "from key-1");

    // Next request starts after the key that succeeded.
    let _ = router.send(&request()).await.unwrap();
    let bearers: Vec<Option<String>> = gateway
        .calls_to(DEEPSEEK)
        .into_iter()
        .map(|c| c.bearer)
        .collect();
    assert_eq!(bearers[2], Some("key-0".to_string()));
    assert_eq!(router.snapshot().metrics.direct_failures, 1);
}

#[tokio::test]
async fn zero_keys_error_without_upstream_call() {
    let (gateway, _clock, router) = harness();
    router.force_mode(RouterMode::Direct);

    let err = router.send(&request()).await.unwrap_err();
    assert!(matches!(err, RouterError::NoKeys(_)));
    assert!(gateway.calls_to(DEEPSEEK).is_empty());
}

#[tokio::test]
async fn unknown_service_is_rejected() {
    let (_gateway, _clock, router) = harness();
    router.force_mode(RouterMode::Direct);
    let err = router
        .send(&AiRequest {
            service: "nonexistent".to_string(),
            query: "q".to_string(),
            max_tokens: None,
            temperature: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::UnknownService(_)));
}

#[tokio::test]
async fn cooldown_expiry_probes_primary_once_and_recovers() {
    let (gateway, clock, router) = harness();
    router.add_key("deepseek", "key-0");
    for _ in 0..3 {
        gateway.queue_err(PRIMARY, "down");
    }
    for _ in 0..3 {
        gateway.queue(DEEPSEEK, Ok(upstream_ok("direct")));
    }
    for _ in 0..3 {
        router.send(&request()).await.unwrap();
    }
    assert_eq!(router.snapshot().mode, RouterMode::Direct);

    // Cooldown elapses; the next call probes the primary exactly once.
    clock.advance(Duration::from_secs(3));
    gateway.queue(
        PRIMARY,
        Ok(json!({"content": "recovered", "model": "aggregate", "usage": {}})),
    );
    let response = router.send(&request()).await.unwrap();
    assert_eq!(response.source, "primary");
    assert_eq!(response.content, "recovered");

    let snapshot = router.snapshot();
    assert_eq!(snapshot.mode, RouterMode::Primary);
    assert!(!snapshot.circuit_open);
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.metrics.circuit_closes, 1);
}

#[tokio::test]
async fn failed_probe_rearms_cooldown_and_stays_direct() {
    let (gateway, clock, router) = harness();
    router.add_key("deepseek", "key-0");
    for _ in 0..4 {
        gateway.queue_err(PRIMARY, "down");
    }
    for _ in 0..5 {
        gateway.queue(DEEPSEEK, Ok(upstream_ok("direct")));
    }
    for _ in 0..3 {
        router.send(&request()).await.unwrap();
    }
    let primary_calls = gateway.calls_to(PRIMARY).len();

    // Probe after the cooldown fails: served direct, cooldown re-armed.
    clock.advance(Duration::from_secs(3));
    let response = router.send(&request()).await.unwrap();
    assert_eq!(response.source, "direct");
    assert_eq!(gateway.calls_to(PRIMARY).len(), primary_calls + 1);
    assert_eq!(router.snapshot().mode, RouterMode::Direct);

    // Cooldown re-armed: the next call does not probe again.
    router.send(&request()).await.unwrap();
    assert_eq!(gateway.calls_to(PRIMARY).len(), primary_calls + 1);
}

#[tokio::test]
async fn health_recovery_nudges_router_back_to_primary() {
    let (gateway, clock, router) = harness();
    router.add_key("deepseek", "key-0");
    for _ in 0..3 {
        gateway.queue_err(PRIMARY, "down");
    }
    for _ in 0..3 {
        gateway.queue(DEEPSEEK, Ok(upstream_ok("direct")));
    }
    for _ in 0..3 {
        router.send(&request()).await.unwrap();
    }
    assert_eq!(router.snapshot().mode, RouterMode::Direct);

    // Primary still cooling down: no recovery even if healthy.
    gateway.set_healthy(true);
    assert!(!router.check_health_and_recover().await);

    clock.advance(Duration::from_secs(3));
    assert!(router.check_health_and_recover().await);
    let snapshot = router.snapshot();
    assert_eq!(snapshot.mode, RouterMode::Primary);
    assert_eq!(snapshot.failure_count, 0);
}
