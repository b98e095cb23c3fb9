//! Alert fan-out with per-key rate limiting.
//!
//! Transports (chat webhooks, email, pagers) live outside the core behind
//! the [`Notifier`] trait; the bus only decides whether an alert goes out.
//! Repeats of the same `(level, title, source)` inside the cool-off window
//! are suppressed, except CRITICAL which always passes.

use crate::clock::Clock;
use crate::config::env_u64;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One alert transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError>;
}

/// Bus configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | STRATA_ALERT_RATE_LIMIT_SECS | 60 | Min seconds between identical alerts. |
#[derive(Debug, Clone)]
pub struct AlertBusConfig {
    pub rate_limit_secs: u64,
}

impl Default for AlertBusConfig {
    fn default() -> Self {
        Self { rate_limit_secs: 60 }
    }
}

impl AlertBusConfig {
    pub fn from_env() -> Self {
        Self {
            rate_limit_secs: env_u64("STRATA_ALERT_RATE_LIMIT_SECS", 60),
        }
    }
}

type AlertCallback = Arc<dyn Fn(&Alert) + Send + Sync>;

pub struct AlertBus {
    config: AlertBusConfig,
    clock: Arc<dyn Clock>,
    notifiers: RwLock<Vec<Arc<dyn Notifier>>>,
    callbacks: RwLock<Vec<AlertCallback>>,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl AlertBus {
    pub fn new(config: AlertBusConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            notifiers: RwLock::new(Vec::new()),
            callbacks: RwLock::new(Vec::new()),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, notifier: Arc<dyn Notifier>) {
        self.notifiers.write().unwrap().push(notifier);
    }

    /// Register a local callback invoked for every delivered alert.
    pub fn on_alert(&self, callback: AlertCallback) {
        self.callbacks.write().unwrap().push(callback);
    }

    /// Send an alert. Returns `false` when it was suppressed by the rate
    /// limit. A failing notifier is logged; the remaining notifiers still
    /// run.
    pub async fn send(
        &self,
        level: AlertLevel,
        title: &str,
        message: &str,
        source: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> bool {
        let alert = Alert {
            level,
            title: title.to_string(),
            message: message.to_string(),
            source: source.to_string(),
            timestamp: self.clock.now(),
            metadata,
        };
        if self.rate_limited(&alert) {
            tracing::debug!(
                target: "strata::alert",
                title,
                source,
                "alert suppressed by rate limit"
            );
            return false;
        }

        for callback in self.callbacks.read().unwrap().iter() {
            callback(&alert);
        }
        let notifiers: Vec<Arc<dyn Notifier>> = self.notifiers.read().unwrap().clone();
        for notifier in notifiers {
            if let Err(e) = notifier.send(&alert).await {
                tracing::error!(target: "strata::alert", error = %e, title, "notifier failed");
            }
        }
        true
    }

    pub async fn info(&self, title: &str, message: &str, source: &str) -> bool {
        self.send(AlertLevel::Info, title, message, source, Default::default())
            .await
    }

    pub async fn warning(&self, title: &str, message: &str, source: &str) -> bool {
        self.send(AlertLevel::Warning, title, message, source, Default::default())
            .await
    }

    pub async fn critical(&self, title: &str, message: &str, source: &str) -> bool {
        self.send(AlertLevel::Critical, title, message, source, Default::default())
            .await
    }

    /// CRITICAL bypasses the rate limit; everything else is keyed by
    /// `(level, title, source)` over the configured cool-off.
    fn rate_limited(&self, alert: &Alert) -> bool {
        if alert.level == AlertLevel::Critical {
            return false;
        }
        let key = format!("{:?}:{}:{}", alert.level, alert.title, alert.source);
        let now = self.clock.monotonic();
        let window = Duration::from_secs(self.config.rate_limit_secs);
        let mut last_sent = self.last_sent.lock().unwrap();
        match last_sent.get(&key) {
            Some(last) if now.duration_since(*last) < window => true,
            _ => {
                last_sent.insert(key, now);
                false
            }
        }
    }
}

/// Records alerts instead of delivering them. For tests.
#[derive(Default)]
pub struct MemoryNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn bus_with_notifier() -> (AlertBus, Arc<MemoryNotifier>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let bus = AlertBus::new(AlertBusConfig { rate_limit_secs: 60 }, clock.clone());
        let notifier = Arc::new(MemoryNotifier::new());
        bus.register(notifier.clone());
        (bus, notifier, clock)
    }

    #[tokio::test]
    async fn identical_warnings_are_rate_limited() {
        let (bus, notifier, clock) = bus_with_notifier();
        assert!(bus.warning("disk", "almost full", "node-1").await);
        assert!(!bus.warning("disk", "almost full", "node-1").await);

        clock.advance(Duration::from_secs(61));
        assert!(bus.warning("disk", "almost full", "node-1").await);
        assert_eq!(notifier.alerts().len(), 2);
    }

    #[tokio::test]
    async fn critical_bypasses_rate_limit() {
        let (bus, notifier, _clock) = bus_with_notifier();
        assert!(bus.critical("breaker", "tripped", "isolation").await);
        assert!(bus.critical("breaker", "tripped", "isolation").await);
        assert_eq!(notifier.alerts().len(), 2);
    }

    #[tokio::test]
    async fn different_sources_do_not_share_the_window() {
        let (bus, _notifier, _clock) = bus_with_notifier();
        assert!(bus.info("up", "ready", "node-1").await);
        assert!(bus.info("up", "ready", "node-2").await);
    }

    #[tokio::test]
    async fn callbacks_fire_on_delivery() {
        let (bus, _notifier, _clock) = bus_with_notifier();
        let seen = Arc::new(Mutex::new(0u32));
        let seen_in_cb = seen.clone();
        bus.on_alert(Arc::new(move |_alert| {
            *seen_in_cb.lock().unwrap() += 1;
        }));
        bus.warning("t", "m", "s").await;
        bus.warning("t", "m", "s").await; // suppressed
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
