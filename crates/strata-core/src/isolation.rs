//! Per-strategy isolation: execution contexts with resource quotas, a
//! circuit breaker per context and cooldown handling.
//!
//! Every trade-like side effect goes through [`IsolationManager::trade_context`],
//! a scoped acquisition that re-checks quota on entry and releases its
//! reservation on every exit path. A quota refusal at that gate trips the
//! context's circuit breaker and puts it in cooldown; the monitor loop
//! returns cooled-down contexts to IDLE and decays the API-rate window.

use crate::clock::Clock;
use crate::config::{env_f64, env_string, env_u32, env_u64};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("strategy not found: {0}")]
    NotFound(String),
    #[error("strategy {id} is not running (state: {state:?})")]
    NotRunning { id: String, state: StrategyState },
    #[error("strategy {id} quota refused: {reason}")]
    QuotaExceeded { id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// No enforcement (legacy bypass).
    None,
    /// Shared resources, per-context accounting. The default.
    Soft,
    /// Per-context memory/CPU scheduling discipline on top of accounting.
    Hard,
    /// Every execution dispatched through the sandbox runner.
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyState {
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
    Cooldown,
}

/// Hard ceilings for one strategy context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceQuota {
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
    pub max_concurrent_trades: u32,
    pub max_position_size: f64,
    pub max_daily_trades: u32,
    pub max_daily_loss: f64,
    pub max_drawdown_percent: f64,
    pub api_rate_limit_per_minute: u32,
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self {
            max_memory_mb: 512.0,
            max_cpu_percent: 25.0,
            max_concurrent_trades: 10,
            max_position_size: 10_000.0,
            max_daily_trades: 100,
            max_daily_loss: 500.0,
            max_drawdown_percent: 20.0,
            api_rate_limit_per_minute: 60,
        }
    }
}

/// Live counters for one strategy context. Daily counters reset only via
/// [`IsolationManager::reset_daily_counters`]; the API-rate window decays
/// one call per monitor tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub open_trades: u32,
    pub current_position: f64,
    pub daily_trade_count: u32,
    pub daily_pnl: f64,
    pub current_drawdown_percent: f64,
    pub api_calls_last_minute: u32,
    pub last_updated: DateTime<Utc>,
}

impl ResourceUsage {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            memory_mb: 0.0,
            cpu_percent: 0.0,
            open_trades: 0,
            current_position: 0.0,
            daily_trade_count: 0,
            daily_pnl: 0.0,
            current_drawdown_percent: 0.0,
            api_calls_last_minute: 0,
            last_updated: now,
        }
    }
}

/// Isolated execution envelope for one strategy. Snapshots of this struct
/// are handed to callers and event handlers; the live copy stays inside the
/// manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyContext {
    pub strategy_id: String,
    pub strategy_name: String,
    pub isolation_level: IsolationLevel,
    pub state: StrategyState,
    pub quota: ResourceQuota,
    pub usage: ResourceUsage,
    pub started_at: Option<DateTime<Utc>>,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_count: u32,
    pub trade_count_total: u64,
    pub total_pnl: f64,
    pub peak_equity: f64,
    pub circuit_breaker_triggered: bool,
    pub circuit_breaker_reason: Option<String>,
    pub circuit_breaker_triggered_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Manager configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | STRATA_ISOLATION_LEVEL | soft | Default isolation level for new contexts. |
/// | STRATA_ISOLATION_MONITOR_INTERVAL_SECS | 5 | Monitor tick period. |
/// | STRATA_ISOLATION_BREAKER_COOLDOWN_SECS | 300 | Cooldown after a breaker trip. |
/// | STRATA_ISOLATION_ERRORS_TO_TRIP | 5 | Error count that trips the breaker. |
/// | STRATA_ISOLATION_MAX_DAILY_LOSS | 500.0 | Default daily loss ceiling. |
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub default_quota: ResourceQuota,
    pub default_isolation_level: IsolationLevel,
    pub monitoring_interval_secs: u64,
    pub breaker_cooldown_secs: u64,
    pub errors_to_trip_breaker: u32,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            default_quota: ResourceQuota::default(),
            default_isolation_level: IsolationLevel::Soft,
            monitoring_interval_secs: 5,
            breaker_cooldown_secs: 300,
            errors_to_trip_breaker: 5,
        }
    }
}

impl IsolationConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let level = match env_string("STRATA_ISOLATION_LEVEL", "soft").as_str() {
            "none" => IsolationLevel::None,
            "hard" => IsolationLevel::Hard,
            "container" => IsolationLevel::Container,
            _ => IsolationLevel::Soft,
        };
        Self {
            default_quota: ResourceQuota {
                max_daily_loss: env_f64(
                    "STRATA_ISOLATION_MAX_DAILY_LOSS",
                    d.default_quota.max_daily_loss,
                ),
                ..d.default_quota
            },
            default_isolation_level: level,
            monitoring_interval_secs: env_u64(
                "STRATA_ISOLATION_MONITOR_INTERVAL_SECS",
                d.monitoring_interval_secs,
            ),
            breaker_cooldown_secs: env_u64(
                "STRATA_ISOLATION_BREAKER_COOLDOWN_SECS",
                d.breaker_cooldown_secs,
            ),
            errors_to_trip_breaker: env_u32(
                "STRATA_ISOLATION_ERRORS_TO_TRIP",
                d.errors_to_trip_breaker,
            ),
        }
    }
}

/// Overview of the manager for status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationStatus {
    pub running: bool,
    pub total_strategies: usize,
    pub strategies_by_state: HashMap<String, Vec<String>>,
    pub default_isolation_level: IsolationLevel,
    pub monitoring_interval_secs: u64,
}

type BreakerHandler = Arc<dyn Fn(&StrategyContext, &str) + Send + Sync>;
type StateHandler = Arc<dyn Fn(&StrategyContext, StrategyState, StrategyState) + Send + Sync>;

struct Inner {
    config: IsolationConfig,
    clock: Arc<dyn Clock>,
    contexts: RwLock<HashMap<String, Arc<Mutex<StrategyContext>>>>,
    breaker_handlers: RwLock<Vec<BreakerHandler>>,
    state_handlers: RwLock<Vec<StateHandler>>,
    running: AtomicBool,
}

/// Manages isolated execution contexts for strategies.
#[derive(Clone)]
pub struct IsolationManager {
    inner: Arc<Inner>,
}

impl IsolationManager {
    pub fn new(config: IsolationConfig, clock: Arc<dyn Clock>) -> Self {
        tracing::info!(
            target: "strata::isolation",
            level = ?config.default_isolation_level,
            "isolation manager initialized"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                clock,
                contexts: RwLock::new(HashMap::new()),
                breaker_handlers: RwLock::new(Vec::new()),
                state_handlers: RwLock::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Register a strategy and create its context. Idempotent on id: an
    /// already-registered id returns the existing context unchanged.
    pub fn register(
        &self,
        strategy_name: &str,
        strategy_id: Option<&str>,
        quota: Option<ResourceQuota>,
        isolation_level: Option<IsolationLevel>,
    ) -> StrategyContext {
        let id = strategy_id
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("strategy_{}", &Uuid::new_v4().simple().to_string()[..8]));

        let mut contexts = self.inner.contexts.write().unwrap();
        if let Some(existing) = contexts.get(&id) {
            tracing::warn!(target: "strata::isolation", strategy_id = %id, "already registered, returning existing");
            return existing.lock().unwrap().clone();
        }

        let context = StrategyContext {
            strategy_id: id.clone(),
            strategy_name: strategy_name.to_string(),
            isolation_level: isolation_level
                .unwrap_or(self.inner.config.default_isolation_level),
            state: StrategyState::Idle,
            quota: quota.unwrap_or_else(|| self.inner.config.default_quota.clone()),
            usage: ResourceUsage::new(self.inner.clock.now()),
            started_at: None,
            last_trade_at: None,
            last_error: None,
            error_count: 0,
            trade_count_total: 0,
            total_pnl: 0.0,
            peak_equity: 0.0,
            circuit_breaker_triggered: false,
            circuit_breaker_reason: None,
            circuit_breaker_triggered_at: None,
            cooldown_until: None,
        };
        contexts.insert(id.clone(), Arc::new(Mutex::new(context.clone())));
        tracing::info!(target: "strata::isolation", strategy_id = %id, name = strategy_name, "strategy registered");
        context
    }

    /// Unregister a strategy, forcing it to STOPPED first.
    pub fn unregister(&self, strategy_id: &str) -> bool {
        let removed = {
            let mut contexts = self.inner.contexts.write().unwrap();
            contexts.remove(strategy_id)
        };
        let Some(ctx) = removed else {
            return false;
        };
        let (snapshot, old_state) = {
            let mut ctx = ctx.lock().unwrap();
            let old = ctx.state;
            ctx.state = StrategyState::Stopped;
            (ctx.clone(), old)
        };
        if old_state == StrategyState::Running {
            self.notify_state_change(&snapshot, old_state);
        }
        tracing::info!(target: "strata::isolation", strategy_id, "strategy unregistered");
        true
    }

    pub fn get(&self, strategy_id: &str) -> Option<StrategyContext> {
        self.context_arc(strategy_id)
            .map(|ctx| ctx.lock().unwrap().clone())
    }

    pub fn list(&self) -> Vec<StrategyContext> {
        self.inner
            .contexts
            .read()
            .unwrap()
            .values()
            .map(|c| c.lock().unwrap().clone())
            .collect()
    }

    /// Start a strategy. Refused while its cooldown is pending; a tripped
    /// breaker from a previous run is cleared on entry.
    pub fn start_strategy(&self, strategy_id: &str) -> bool {
        let Some(ctx) = self.context_arc(strategy_id) else {
            return false;
        };
        let now = self.inner.clock.now();
        let (snapshot, old_state) = {
            let mut ctx = ctx.lock().unwrap();
            if ctx.state == StrategyState::Running {
                return true;
            }
            if let Some(until) = ctx.cooldown_until {
                if now < until {
                    tracing::warn!(
                        target: "strata::isolation",
                        strategy_id,
                        cooldown_until = %until,
                        "start refused: cooldown pending"
                    );
                    return false;
                }
            }
            if ctx.circuit_breaker_triggered {
                ctx.circuit_breaker_triggered = false;
                ctx.circuit_breaker_reason = None;
                ctx.circuit_breaker_triggered_at = None;
            }
            let old = ctx.state;
            ctx.state = StrategyState::Running;
            ctx.started_at = Some(now);
            (ctx.clone(), old)
        };
        self.notify_state_change(&snapshot, old_state);
        tracing::info!(target: "strata::isolation", strategy_id, "strategy started");
        true
    }

    pub fn stop_strategy(&self, strategy_id: &str, reason: &str) -> bool {
        self.transition(strategy_id, StrategyState::Stopped, reason)
    }

    pub fn pause_strategy(&self, strategy_id: &str, reason: &str) -> bool {
        self.transition(strategy_id, StrategyState::Paused, reason)
    }

    fn transition(&self, strategy_id: &str, to: StrategyState, reason: &str) -> bool {
        let Some(ctx) = self.context_arc(strategy_id) else {
            return false;
        };
        let (snapshot, old_state) = {
            let mut ctx = ctx.lock().unwrap();
            let old = ctx.state;
            ctx.state = to;
            (ctx.clone(), old)
        };
        self.notify_state_change(&snapshot, old_state);
        tracing::info!(target: "strata::isolation", strategy_id, ?to, reason, "strategy state changed");
        true
    }

    /// Check whether a strategy is inside all quota limits, optionally for a
    /// prospective trade of `trade_size`. Returns `(allowed, reason)`.
    pub fn check_quota(
        &self,
        strategy_id: &str,
        trade_size: Option<f64>,
    ) -> (bool, Option<String>) {
        let Some(ctx) = self.context_arc(strategy_id) else {
            return (false, Some("Strategy not found".to_string()));
        };
        let ctx = ctx.lock().unwrap();
        match quota_breach(&ctx, trade_size) {
            Some(reason) => (false, Some(reason)),
            None => (true, None),
        }
    }

    /// Scoped trade acquisition. On entry the quota is re-checked; a refusal
    /// trips the circuit breaker and returns `QuotaExceeded`. On success the
    /// open-trade, position and API-rate counters are reserved; the returned
    /// guard releases the reservation on drop, on every exit path.
    pub fn trade_context(
        &self,
        strategy_id: &str,
        trade_size: f64,
    ) -> Result<TradeGuard, IsolationError> {
        let ctx = self
            .context_arc(strategy_id)
            .ok_or_else(|| IsolationError::NotFound(strategy_id.to_string()))?;

        let refusal = {
            let mut locked = ctx.lock().unwrap();
            if locked.state != StrategyState::Running {
                return Err(IsolationError::NotRunning {
                    id: strategy_id.to_string(),
                    state: locked.state,
                });
            }
            match quota_breach(&locked, Some(trade_size)) {
                Some(reason) => Some(reason),
                None => {
                    locked.usage.open_trades += 1;
                    locked.usage.current_position += trade_size;
                    locked.usage.api_calls_last_minute += 1;
                    None
                }
            }
        };

        if let Some(reason) = refusal {
            self.trip_breaker(&ctx, &reason);
            return Err(IsolationError::QuotaExceeded {
                id: strategy_id.to_string(),
                reason,
            });
        }

        Ok(TradeGuard {
            ctx,
            trade_size,
            clock: Arc::clone(&self.inner.clock),
        })
    }

    /// Record an error against a strategy. Reaching the configured error
    /// count trips the breaker.
    pub fn record_error(&self, strategy_id: &str, error: &str) {
        let Some(ctx) = self.context_arc(strategy_id) else {
            return;
        };
        let trip = {
            let mut locked = ctx.lock().unwrap();
            locked.error_count += 1;
            locked.last_error = Some(error.to_string());
            locked.error_count >= self.inner.config.errors_to_trip_breaker
        };
        if trip {
            let count = ctx.lock().unwrap().error_count;
            self.trip_breaker(&ctx, &format!("Too many errors ({})", count));
        }
    }

    /// Update sampled memory/CPU usage. Exceeding the memory quota trips the
    /// breaker.
    pub fn update_resource_usage(
        &self,
        strategy_id: &str,
        memory_mb: Option<f64>,
        cpu_percent: Option<f64>,
    ) {
        let Some(ctx) = self.context_arc(strategy_id) else {
            return;
        };
        let breach = {
            let mut locked = ctx.lock().unwrap();
            if let Some(mem) = memory_mb {
                locked.usage.memory_mb = mem;
            }
            if let Some(cpu) = cpu_percent {
                locked.usage.cpu_percent = cpu;
            }
            locked.usage.last_updated = self.inner.clock.now();
            match memory_mb {
                Some(mem) if mem > locked.quota.max_memory_mb => Some(format!(
                    "Memory limit exceeded ({:.0}MB > {:.0}MB)",
                    mem, locked.quota.max_memory_mb
                )),
                _ => None,
            }
        };
        if let Some(reason) = breach {
            self.trip_breaker(&ctx, &reason);
        }
    }

    /// Zero the daily counters of every context. Idempotent.
    pub fn reset_daily_counters(&self) {
        let contexts = self.inner.contexts.read().unwrap();
        for ctx in contexts.values() {
            let mut locked = ctx.lock().unwrap();
            locked.usage.daily_trade_count = 0;
            locked.usage.daily_pnl = 0.0;
            locked.error_count = 0;
            locked.last_error = None;
        }
        tracing::info!(target: "strata::isolation", "daily counters reset");
    }

    pub fn on_circuit_breaker(&self, handler: BreakerHandler) {
        self.inner.breaker_handlers.write().unwrap().push(handler);
    }

    pub fn on_state_change(&self, handler: StateHandler) {
        self.inner.state_handlers.write().unwrap().push(handler);
    }

    /// Route every breaker trip to the alert bus as a CRITICAL alert.
    pub fn alert_on_breaker(&self, bus: Arc<crate::alert::AlertBus>) {
        self.on_circuit_breaker(Arc::new(move |ctx, reason| {
            let bus = Arc::clone(&bus);
            let strategy_id = ctx.strategy_id.clone();
            let reason = reason.to_string();
            tokio::spawn(async move {
                bus.critical(
                    "Strategy circuit breaker tripped",
                    &format!("{}: {}", strategy_id, reason),
                    "isolation",
                )
                .await;
            });
        }));
    }

    /// Spawn the monitor loop. Stopped cooperatively by [`Self::stop_monitor`];
    /// the loop finishes its current sleep quantum before exiting.
    pub fn start_monitor(&self) -> tokio::task::JoinHandle<()> {
        self.inner.running.store(true, Ordering::SeqCst);
        let manager = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_secs(manager.inner.config.monitoring_interval_secs);
            while manager.inner.running.load(Ordering::SeqCst) {
                manager.inner.clock.sleep(interval).await;
                manager.monitor_tick();
            }
            tracing::info!(target: "strata::isolation", "monitor loop stopped");
        })
    }

    pub fn stop_monitor(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// One monitor pass: decay the API-rate window and wake contexts whose
    /// cooldown has elapsed. Public so tests can drive it directly.
    pub fn monitor_tick(&self) {
        let now = self.inner.clock.now();
        let contexts: Vec<Arc<Mutex<StrategyContext>>> = {
            self.inner
                .contexts
                .read()
                .unwrap()
                .values()
                .cloned()
                .collect()
        };
        for ctx in contexts {
            let woke = {
                let mut locked = ctx.lock().unwrap();
                locked.usage.api_calls_last_minute =
                    locked.usage.api_calls_last_minute.saturating_sub(1);

                let expired = locked.state == StrategyState::Cooldown
                    && locked.cooldown_until.is_some_and(|until| now >= until);
                if expired {
                    let old = locked.state;
                    locked.state = StrategyState::Idle;
                    locked.cooldown_until = None;
                    locked.circuit_breaker_triggered = false;
                    locked.circuit_breaker_reason = None;
                    locked.circuit_breaker_triggered_at = None;
                    Some((locked.clone(), old))
                } else {
                    None
                }
            };
            if let Some((snapshot, old_state)) = woke {
                tracing::info!(
                    target: "strata::isolation",
                    strategy_id = %snapshot.strategy_id,
                    "cooldown expired"
                );
                self.notify_state_change(&snapshot, old_state);
            }
        }
    }

    pub fn status(&self) -> IsolationStatus {
        let contexts = self.inner.contexts.read().unwrap();
        let mut by_state: HashMap<String, Vec<String>> = HashMap::new();
        for ctx in contexts.values() {
            let locked = ctx.lock().unwrap();
            let key = format!("{:?}", locked.state).to_lowercase();
            by_state.entry(key).or_default().push(locked.strategy_id.clone());
        }
        IsolationStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            total_strategies: contexts.len(),
            strategies_by_state: by_state,
            default_isolation_level: self.inner.config.default_isolation_level,
            monitoring_interval_secs: self.inner.config.monitoring_interval_secs,
        }
    }

    fn context_arc(&self, strategy_id: &str) -> Option<Arc<Mutex<StrategyContext>>> {
        self.inner
            .contexts
            .read()
            .unwrap()
            .get(strategy_id)
            .cloned()
    }

    fn trip_breaker(&self, ctx: &Arc<Mutex<StrategyContext>>, reason: &str) {
        let cooldown = self.inner.config.breaker_cooldown_secs;
        let now = self.inner.clock.now();
        let (snapshot, old_state) = {
            let mut locked = ctx.lock().unwrap();
            locked.circuit_breaker_triggered = true;
            locked.circuit_breaker_reason = Some(reason.to_string());
            locked.circuit_breaker_triggered_at = Some(now);
            locked.cooldown_until = Some(now + ChronoDuration::seconds(cooldown as i64));
            let old = locked.state;
            locked.state = StrategyState::Cooldown;
            (locked.clone(), old)
        };
        tracing::warn!(
            target: "strata::isolation",
            strategy_id = %snapshot.strategy_id,
            reason,
            cooldown_until = ?snapshot.cooldown_until,
            "circuit breaker tripped"
        );
        let handlers: Vec<BreakerHandler> =
            self.inner.breaker_handlers.read().unwrap().clone();
        for handler in handlers {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(&snapshot, reason)
            }));
            if outcome.is_err() {
                tracing::error!(target: "strata::isolation", "circuit breaker handler panicked");
            }
        }
        self.notify_state_change(&snapshot, old_state);
    }

    fn notify_state_change(&self, snapshot: &StrategyContext, old_state: StrategyState) {
        let handlers: Vec<StateHandler> = self.inner.state_handlers.read().unwrap().clone();
        for handler in handlers {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(snapshot, old_state, snapshot.state)
            }));
            if outcome.is_err() {
                tracing::error!(target: "strata::isolation", "state change handler panicked");
            }
        }
    }
}

/// Returns the first quota breach, in the documented check order, or `None`
/// when the strategy is inside all limits. A daily loss of exactly the
/// limit is still allowed; strictly beyond is refused.
fn quota_breach(ctx: &StrategyContext, trade_size: Option<f64>) -> Option<String> {
    let quota = &ctx.quota;
    let usage = &ctx.usage;

    if usage.daily_trade_count >= quota.max_daily_trades {
        return Some(format!(
            "Daily trade limit reached ({})",
            quota.max_daily_trades
        ));
    }
    if usage.daily_pnl < -quota.max_daily_loss {
        return Some(format!("Daily loss limit reached ({})", quota.max_daily_loss));
    }
    if usage.current_drawdown_percent >= quota.max_drawdown_percent {
        return Some(format!(
            "Max drawdown reached ({}%)",
            quota.max_drawdown_percent
        ));
    }
    if usage.open_trades >= quota.max_concurrent_trades {
        return Some(format!(
            "Max concurrent trades reached ({})",
            quota.max_concurrent_trades
        ));
    }
    if let Some(size) = trade_size {
        if usage.current_position + size > quota.max_position_size {
            return Some(format!(
                "Position size would exceed limit ({})",
                quota.max_position_size
            ));
        }
    }
    if usage.api_calls_last_minute >= quota.api_rate_limit_per_minute {
        return Some(format!(
            "API rate limit reached ({}/min)",
            quota.api_rate_limit_per_minute
        ));
    }
    None
}

/// Scoped trade handle. Call [`TradeGuard::record_trade`] with the realized
/// PnL; dropping the guard releases the open-trade and position reservation
/// whether or not the trade was recorded.
pub struct TradeGuard {
    ctx: Arc<Mutex<StrategyContext>>,
    trade_size: f64,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TradeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeGuard")
            .field("trade_size", &self.trade_size)
            .finish()
    }
}

impl TradeGuard {
    /// Record a finished trade: daily and lifetime counters, peak equity
    /// and drawdown. Equity is cumulative realized PnL.
    pub fn record_trade(&self, pnl: f64) {
        let mut ctx = self.ctx.lock().unwrap();
        ctx.usage.daily_trade_count += 1;
        ctx.usage.daily_pnl += pnl;
        ctx.trade_count_total += 1;
        ctx.total_pnl += pnl;
        ctx.last_trade_at = Some(self.clock.now());

        let equity = ctx.total_pnl;
        if equity > ctx.peak_equity {
            ctx.peak_equity = equity;
        }
        if ctx.peak_equity > 0.0 {
            let drawdown = (ctx.peak_equity - equity) / ctx.peak_equity * 100.0;
            ctx.usage.current_drawdown_percent = drawdown.max(0.0);
        }
    }
}

impl Drop for TradeGuard {
    fn drop(&mut self) {
        let mut ctx = self.ctx.lock().unwrap();
        ctx.usage.open_trades = ctx.usage.open_trades.saturating_sub(1);
        ctx.usage.current_position = (ctx.usage.current_position - self.trade_size).max(0.0);
        ctx.usage.last_updated = self.clock.now();
    }
}
