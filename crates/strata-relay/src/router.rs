//! Primary/direct request router with a consecutive-failure circuit
//! breaker and per-service key rotation.
//!
//! In PRIMARY mode every request goes to the co-hosted aggregation
//! service; `max_failures` consecutive failures open the circuit and
//! switch to DIRECT for `circuit_timeout_secs`. Once the cooldown elapses
//! the next `send` probes the primary exactly once: success reverts to
//! PRIMARY, failure re-arms the cooldown and stays DIRECT. At most one
//! mode transition happens per call.
//!
//! DIRECT mode walks the service's credential ring starting at the last
//! rotation index; the index advances only past a key that succeeded.

use crate::gateway::HttpGateway;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strata_core::config::{env_string, env_u32, env_u64};
use strata_core::{AlertBus, Clock};
use thiserror::Error;

const PRIMARY_TIMEOUT: Duration = Duration::from_secs(10);
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_TOKENS: u32 = 2000;
const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no API keys available for {0}")]
    NoKeys(String),
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("all direct API calls failed for {0}")]
    AllKeysFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterMode {
    Primary,
    Direct,
}

/// Upstream profile for one service family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub upstream_url: String,
    pub model_tag: String,
}

/// Router configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | STRATA_ROUTER_PRIMARY_URL | http://localhost:3000 | Co-hosted primary service. |
/// | STRATA_ROUTER_MAX_FAILURES | 3 | Consecutive failures that open the circuit. |
/// | STRATA_ROUTER_CIRCUIT_TIMEOUT_SECS | 300 | Cooldown before the next primary probe. |
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub primary_url: String,
    pub max_failures: u32,
    pub circuit_timeout_secs: u64,
    pub services: HashMap<String, ServiceProfile>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let services = HashMap::from([
            (
                "deepseek".to_string(),
                ServiceProfile {
                    upstream_url: "https://api.deepseek.com/v1/chat/completions".to_string(),
                    model_tag: "deepseek-chat".to_string(),
                },
            ),
            (
                "perplexity".to_string(),
                ServiceProfile {
                    upstream_url: "https://api.perplexity.ai/chat/completions".to_string(),
                    model_tag: "sonar".to_string(),
                },
            ),
        ]);
        Self {
            primary_url: "http://localhost:3000".to_string(),
            max_failures: 3,
            circuit_timeout_secs: 300,
            services,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            primary_url: env_string("STRATA_ROUTER_PRIMARY_URL", &d.primary_url),
            max_failures: env_u32("STRATA_ROUTER_MAX_FAILURES", d.max_failures),
            circuit_timeout_secs: env_u64(
                "STRATA_ROUTER_CIRCUIT_TIMEOUT_SECS",
                d.circuit_timeout_secs,
            ),
            services: d.services,
        }
    }
}

/// A request to route. `service` picks the upstream family when the call
/// falls back to DIRECT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiRequest {
    pub service: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Response shape common to both routes: callers are indifferent to the
/// source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedResponse {
    pub content: String,
    pub model: String,
    pub usage: Value,
    /// `"primary"` or `"direct"`.
    pub source: String,
    pub service: String,
}

#[derive(Debug, Default)]
struct RouterMetrics {
    primary_requests: AtomicU64,
    primary_failures: AtomicU64,
    direct_requests: AtomicU64,
    direct_failures: AtomicU64,
    circuit_opens: AtomicU64,
    circuit_closes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterMetricsSnapshot {
    pub primary_requests: u64,
    pub primary_failures: u64,
    pub direct_requests: u64,
    pub direct_failures: u64,
    pub circuit_opens: u64,
    pub circuit_closes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSnapshot {
    pub mode: RouterMode,
    pub circuit_open: bool,
    pub failure_count: u32,
    pub metrics: RouterMetricsSnapshot,
}

struct CircuitState {
    mode: RouterMode,
    failure_count: u32,
    circuit_open: bool,
    circuit_open_until: Option<Instant>,
}

enum Route {
    Primary,
    /// One-shot primary attempt after the cooldown elapsed.
    Probe,
    Direct,
}

pub struct ReliabilityRouter {
    config: RouterConfig,
    gateway: Arc<dyn HttpGateway>,
    clock: Arc<dyn Clock>,
    state: Mutex<CircuitState>,
    keys: dashmap::DashMap<String, Vec<String>>,
    key_index: dashmap::DashMap<String, usize>,
    metrics: RouterMetrics,
    alerts: Option<Arc<AlertBus>>,
}

impl ReliabilityRouter {
    pub fn new(
        config: RouterConfig,
        gateway: Arc<dyn HttpGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            gateway,
            clock,
            state: Mutex::new(CircuitState {
                mode: RouterMode::Primary,
                failure_count: 0,
                circuit_open: false,
                circuit_open_until: None,
            }),
            keys: dashmap::DashMap::new(),
            key_index: dashmap::DashMap::new(),
            metrics: RouterMetrics::default(),
            alerts: None,
        }
    }

    /// Send a CRITICAL alert when the circuit opens and an INFO alert on
    /// recovery to PRIMARY.
    pub fn with_alert_bus(mut self, bus: Arc<AlertBus>) -> Self {
        self.alerts = Some(bus);
        self
    }

    pub fn primary_url(&self) -> &str {
        &self.config.primary_url
    }

    /// Add a credential to a service's rotation ring.
    pub fn add_key(&self, service: &str, api_key: &str) {
        let mut ring = self.keys.entry(service.to_string()).or_default();
        ring.push(api_key.to_string());
        tracing::info!(
            target: "strata::router",
            service,
            total = ring.len(),
            "API key added"
        );
    }

    /// Route a request. Failures of the primary fall back to DIRECT within
    /// the same call; an error is returned only when the direct ring is
    /// exhausted too.
    pub async fn send(&self, request: &AiRequest) -> Result<UnifiedResponse, RouterError> {
        let route = {
            let state = self.state.lock().unwrap();
            match (state.mode, state.circuit_open) {
                (RouterMode::Primary, _) => Route::Primary,
                (RouterMode::Direct, true) => {
                    let elapsed = state
                        .circuit_open_until
                        .is_none_or(|until| self.clock.monotonic() >= until);
                    if elapsed {
                        Route::Probe
                    } else {
                        Route::Direct
                    }
                }
                (RouterMode::Direct, false) => Route::Direct,
            }
        };

        match route {
            Route::Primary => match self.call_primary(request).await {
                Ok(response) => {
                    self.state.lock().unwrap().failure_count = 0;
                    self.metrics.primary_requests.fetch_add(1, Ordering::Relaxed);
                    Ok(response)
                }
                Err(e) => {
                    self.metrics.primary_failures.fetch_add(1, Ordering::Relaxed);
                    let opened = {
                        let mut state = self.state.lock().unwrap();
                        state.failure_count += 1;
                        if state.failure_count >= self.config.max_failures && !state.circuit_open {
                            state.mode = RouterMode::Direct;
                            state.circuit_open = true;
                            state.circuit_open_until = Some(
                                self.clock.monotonic()
                                    + Duration::from_secs(self.config.circuit_timeout_secs),
                            );
                            true
                        } else {
                            false
                        }
                    };
                    if opened {
                        self.metrics.circuit_opens.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            target: "strata::router",
                            failures = self.config.max_failures,
                            "circuit opened, switching to direct"
                        );
                        if let Some(bus) = &self.alerts {
                            bus.critical(
                                "Primary circuit opened",
                                &format!(
                                    "{} consecutive failures, routing direct",
                                    self.config.max_failures
                                ),
                                "router",
                            )
                            .await;
                        }
                    }
                    tracing::error!(target: "strata::router", error = %e, "primary request failed, falling back to direct");
                    self.send_direct(request).await
                }
            },
            Route::Probe => match self.call_primary(request).await {
                Ok(response) => {
                    {
                        let mut state = self.state.lock().unwrap();
                        state.mode = RouterMode::Primary;
                        state.circuit_open = false;
                        state.circuit_open_until = None;
                        state.failure_count = 0;
                    }
                    self.metrics.circuit_closes.fetch_add(1, Ordering::Relaxed);
                    self.metrics.primary_requests.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(target: "strata::router", "probe succeeded, back to primary");
                    if let Some(bus) = &self.alerts {
                        bus.info("Primary recovered", "probe succeeded, routing primary", "router")
                            .await;
                    }
                    Ok(response)
                }
                Err(e) => {
                    self.metrics.primary_failures.fetch_add(1, Ordering::Relaxed);
                    {
                        // Probe failed: re-arm the cooldown, stay DIRECT.
                        let mut state = self.state.lock().unwrap();
                        state.circuit_open_until = Some(
                            self.clock.monotonic()
                                + Duration::from_secs(self.config.circuit_timeout_secs),
                        );
                    }
                    tracing::warn!(target: "strata::router", error = %e, "probe failed, cooldown re-armed");
                    self.send_direct(request).await
                }
            },
            Route::Direct => self.send_direct(request).await,
        }
    }

    async fn call_primary(&self, request: &AiRequest) -> Result<UnifiedResponse, String> {
        let url = format!("{}/api/query", self.config.primary_url);
        let body = serde_json::to_value(request).map_err(|e| e.to_string())?;
        let data = self
            .gateway
            .post_json(&url, None, &body, PRIMARY_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        Ok(UnifiedResponse {
            content: data
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| data.to_string()),
            model: data
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or("primary")
                .to_string(),
            usage: data.get("usage").cloned().unwrap_or_else(|| json!({})),
            source: "primary".to_string(),
            service: request.service.clone(),
        })
    }

    /// Walk the service's key ring starting at the rotation index. On
    /// success the index advances past the winning key; a failing key is
    /// logged and the next one is tried.
    async fn send_direct(&self, request: &AiRequest) -> Result<UnifiedResponse, RouterError> {
        let service = &request.service;
        let profile = self
            .config
            .services
            .get(service)
            .ok_or_else(|| RouterError::UnknownService(service.clone()))?;
        let ring: Vec<String> = self
            .keys
            .get(service)
            .map(|keys| keys.clone())
            .unwrap_or_default();
        if ring.is_empty() {
            return Err(RouterError::NoKeys(service.clone()));
        }
        self.metrics.direct_requests.fetch_add(1, Ordering::Relaxed);

        let body = json!({
            "model": profile.model_tag,
            "messages": [{"role": "user", "content": request.query}],
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        });

        let start = self.key_index.get(service).map(|i| *i).unwrap_or(0);
        for offset in 0..ring.len() {
            let index = (start + offset) % ring.len();
            match self
                .gateway
                .post_json(
                    &profile.upstream_url,
                    Some(&ring[index]),
                    &body,
                    UPSTREAM_TIMEOUT,
                )
                .await
            {
                Ok(data) => {
                    self.key_index
                        .insert(service.clone(), (index + 1) % ring.len());
                    return Ok(UnifiedResponse {
                        content: data["choices"][0]["message"]["content"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        model: data
                            .get("model")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        usage: data.get("usage").cloned().unwrap_or_else(|| json!({})),
                        source: "direct".to_string(),
                        service: service.clone(),
                    });
                }
                Err(e) => {
                    self.metrics.direct_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        target: "strata::router",
                        service,
                        key_index = index,
                        error = %e,
                        "direct call failed, trying next key"
                    );
                }
            }
        }
        Err(RouterError::AllKeysFailed(service.clone()))
    }

    /// Probe the primary's health endpoint and, if it answers while the
    /// cooldown has elapsed, move back to PRIMARY. For external callers
    /// like the self-healing monitor. Returns `true` when a recovery
    /// happened.
    pub async fn check_health_and_recover(&self) -> bool {
        let eligible = {
            let state = self.state.lock().unwrap();
            state.mode == RouterMode::Direct
                && (!state.circuit_open
                    || state
                        .circuit_open_until
                        .is_none_or(|until| self.clock.monotonic() >= until))
        };
        if !eligible {
            return false;
        }
        let url = format!("{}/health", self.config.primary_url);
        if !self.gateway.get_ok(&url, HEALTH_TIMEOUT).await {
            return false;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.mode != RouterMode::Direct {
                return false;
            }
            state.mode = RouterMode::Primary;
            state.circuit_open = false;
            state.circuit_open_until = None;
            state.failure_count = 0;
        }
        self.metrics.circuit_closes.fetch_add(1, Ordering::Relaxed);
        tracing::info!(target: "strata::router", "primary healthy, recovered to primary mode");
        true
    }

    /// Force the mode. Forcing PRIMARY also closes the circuit and clears
    /// the failure count. Used by the monitor's escalation and by tests.
    pub fn force_mode(&self, mode: RouterMode) {
        let mut state = self.state.lock().unwrap();
        tracing::warn!(target: "strata::router", ?mode, "mode forced");
        state.mode = mode;
        if mode == RouterMode::Primary {
            state.circuit_open = false;
            state.circuit_open_until = None;
            state.failure_count = 0;
        }
    }

    pub fn snapshot(&self) -> RouterSnapshot {
        let state = self.state.lock().unwrap();
        RouterSnapshot {
            mode: state.mode,
            circuit_open: state.circuit_open,
            failure_count: state.failure_count,
            metrics: RouterMetricsSnapshot {
                primary_requests: self.metrics.primary_requests.load(Ordering::Relaxed),
                primary_failures: self.metrics.primary_failures.load(Ordering::Relaxed),
                direct_requests: self.metrics.direct_requests.load(Ordering::Relaxed),
                direct_failures: self.metrics.direct_failures.load(Ordering::Relaxed),
                circuit_opens: self.metrics.circuit_opens.load(Ordering::Relaxed),
                circuit_closes: self.metrics.circuit_closes.load(Ordering::Relaxed),
            },
        }
    }
}
