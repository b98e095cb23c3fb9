//! Saga orchestrator: a finite state machine over ordered steps with
//! reverse-order compensation and durable checkpoints.
//!
//! Step actions are trait objects bound to the step list in process; the
//! checkpoint persists only the data half (name, status, retries, result),
//! so a restarted orchestrator rebinds actions by position and trusts the
//! checkpoint for what has already happened. Actions must be engineered for
//! at-least-once execution; the orchestrator does not deduplicate.

use crate::clock::Clock;
use crate::config::{env_string, env_u64};
use crate::store::{KvStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the orchestrator itself (not by step actions).
#[derive(Debug, Error)]
pub enum SagaError {
    #[error("checkpoint read failed: {0}")]
    Store(#[from] StoreError),
    #[error("checkpoint decode failed: {0}")]
    CheckpointDecode(String),
    #[error("checkpoint step {index} is '{checkpoint}' but the bound step list has '{bound}'")]
    StepMismatch {
        index: usize,
        checkpoint: String,
        bound: String,
    },
}

pub type ActionError = Box<dyn std::error::Error + Send + Sync>;
pub type SagaContext = serde_json::Map<String, serde_json::Value>;

/// Forward/compensating behavior of one step. Implementations that have a
/// rollback override `compensate` and return `true` from `has_compensation`.
#[async_trait]
pub trait SagaAction: Send + Sync {
    /// Forward operation. A returned object is merged into the saga context
    /// for later steps.
    async fn execute(&self, ctx: &SagaContext) -> Result<serde_json::Value, ActionError>;

    /// Reverse operation, invoked with the result this step produced.
    async fn compensate(&self, _result: &serde_json::Value) -> Result<(), ActionError> {
        Ok(())
    }

    fn has_compensation(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaState {
    Idle,
    Running,
    Compensating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Compensating,
    Compensated,
    Failed,
}

/// Step definition: a name, an action and its execution limits.
pub struct SagaStep {
    pub name: String,
    pub action: Arc<dyn SagaAction>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl SagaStep {
    pub fn new(name: impl Into<String>, action: Arc<dyn SagaAction>) -> Self {
        Self {
            name: name.into(),
            action,
            timeout_secs: 300,
            max_retries: 3,
        }
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Runtime state of a step inside one orchestrator.
struct StepRuntime {
    def: SagaStep,
    status: StepStatus,
    retry_count: u32,
    result: Option<serde_json::Value>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl StepRuntime {
    fn new(def: SagaStep) -> Self {
        Self {
            def,
            status: StepStatus::Pending,
            retry_count: 0,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Serializable half of a step: everything but the action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub name: String,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable snapshot of a saga, keyed by saga id in the key/value store.
/// On restart this is the single source of truth for what already happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaCheckpoint {
    pub saga_id: String,
    pub state: SagaState,
    pub current_step_index: usize,
    pub completed_steps: Vec<StepCheckpoint>,
    pub context: SagaContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Orchestrator configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | STRATA_SAGA_CHECKPOINT_PREFIX | saga_checkpoint | Key prefix for checkpoints. |
/// | STRATA_SAGA_CHECKPOINT_TTL_SECS | 86400 | Checkpoint lifetime. |
/// | STRATA_SAGA_DEFAULT_STEP_TIMEOUT_SECS | 300 | Timeout for steps that do not set one. |
#[derive(Debug, Clone)]
pub struct SagaConfig {
    pub checkpoint_prefix: String,
    pub checkpoint_ttl_secs: u64,
    pub default_step_timeout_secs: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            checkpoint_prefix: "saga_checkpoint".to_string(),
            checkpoint_ttl_secs: 86_400,
            default_step_timeout_secs: 300,
        }
    }
}

impl SagaConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            checkpoint_prefix: env_string("STRATA_SAGA_CHECKPOINT_PREFIX", &d.checkpoint_prefix),
            checkpoint_ttl_secs: env_u64("STRATA_SAGA_CHECKPOINT_TTL_SECS", d.checkpoint_ttl_secs),
            default_step_timeout_secs: env_u64(
                "STRATA_SAGA_DEFAULT_STEP_TIMEOUT_SECS",
                d.default_step_timeout_secs,
            ),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SagaMetricsSnapshot {
    pub sagas_started: u64,
    pub sagas_completed: u64,
    pub sagas_failed: u64,
    pub sagas_compensated: u64,
    pub steps_executed: u64,
    pub steps_compensated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaOutcome {
    Completed,
    Failed,
}

/// Result of one `execute` run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaReport {
    pub status: SagaOutcome,
    pub saga_id: String,
    pub results: Vec<serde_json::Value>,
    pub error: Option<String>,
    pub completed_steps: usize,
    pub compensated_steps: usize,
}

/// Point-in-time view of the saga for dashboards and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStatus {
    pub saga_id: String,
    pub state: SagaState,
    pub current_step: usize,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub steps: Vec<StepStatusLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatusLine {
    pub name: String,
    pub status: StepStatus,
    pub retry_count: u32,
    pub error: Option<String>,
}

/// Executes one saga. One orchestrator owns one saga id; checkpoints for
/// that id are only ever written by its owner.
pub struct SagaOrchestrator {
    saga_id: String,
    config: SagaConfig,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    steps: Vec<StepRuntime>,
    state: SagaState,
    current_step_index: usize,
    /// `(step index, result)` in completion order.
    completed: Vec<(usize, serde_json::Value)>,
    context: SagaContext,
    metrics: SagaMetricsSnapshot,
}

impl SagaOrchestrator {
    pub fn new(
        steps: Vec<SagaStep>,
        config: SagaConfig,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_saga_id(Uuid::new_v4().to_string(), steps, config, kv, clock)
    }

    pub fn with_saga_id(
        saga_id: String,
        steps: Vec<SagaStep>,
        config: SagaConfig,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let steps = steps.into_iter().map(StepRuntime::new).collect();
        Self {
            saga_id,
            config,
            kv,
            clock,
            steps,
            state: SagaState::Idle,
            current_step_index: 0,
            completed: Vec::new(),
            context: SagaContext::new(),
            metrics: SagaMetricsSnapshot::default(),
        }
    }

    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn metrics(&self) -> SagaMetricsSnapshot {
        self.metrics
    }

    /// Run all steps in order. On any step exhausting its retries the saga
    /// compensates every previously completed step in reverse order and
    /// reports failure.
    pub async fn execute(&mut self, context: Option<SagaContext>) -> SagaReport {
        self.context = context.unwrap_or_default();
        self.state = SagaState::Running;
        self.metrics.sagas_started += 1;
        self.save_checkpoint().await;

        for index in 0..self.steps.len() {
            self.current_step_index = index;
            match self.execute_step(index).await {
                Ok(result) => {
                    self.completed.push((index, result));
                    self.metrics.steps_executed += 1;
                    self.save_checkpoint().await;
                }
                Err(error) => {
                    let step_name = self.steps[index].def.name.clone();
                    tracing::warn!(
                        target: "strata::saga",
                        saga_id = %self.saga_id,
                        step = %step_name,
                        error = %error,
                        "step failed, compensating"
                    );
                    self.state = SagaState::Compensating;
                    self.save_checkpoint().await;
                    let compensated = self.compensate().await;
                    self.state = SagaState::Failed;
                    self.metrics.sagas_failed += 1;
                    self.save_checkpoint().await;
                    return SagaReport {
                        status: SagaOutcome::Failed,
                        saga_id: self.saga_id.clone(),
                        results: Vec::new(),
                        error: Some(format!("step '{}' failed: {}", step_name, error)),
                        completed_steps: self.completed.len(),
                        compensated_steps: compensated,
                    };
                }
            }
        }

        self.state = SagaState::Completed;
        self.metrics.sagas_completed += 1;
        self.save_checkpoint().await;
        SagaReport {
            status: SagaOutcome::Completed,
            saga_id: self.saga_id.clone(),
            results: self.completed.iter().map(|(_, r)| r.clone()).collect(),
            error: None,
            completed_steps: self.completed.len(),
            compensated_steps: 0,
        }
    }

    /// Execute one step with its wall-clock timeout and retry budget.
    /// Returns the step result or the terminal error text.
    async fn execute_step(&mut self, index: usize) -> Result<serde_json::Value, String> {
        let (action, timeout_secs, max_retries, name) = {
            let step = &mut self.steps[index];
            step.status = StepStatus::Executing;
            step.started_at = Some(self.clock.now());
            (
                Arc::clone(&step.def.action),
                step.def.timeout_secs,
                step.def.max_retries,
                step.def.name.clone(),
            )
        };

        for attempt in 0..=max_retries {
            let outcome = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                action.execute(&self.context),
            )
            .await;

            let error = match outcome {
                Ok(Ok(result)) => {
                    let step = &mut self.steps[index];
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(self.clock.now());
                    step.result = Some(result.clone());
                    if let serde_json::Value::Object(map) = &result {
                        for (k, v) in map {
                            self.context.insert(k.clone(), v.clone());
                        }
                    }
                    return Ok(result);
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timeout after {}s", timeout_secs),
            };

            let step = &mut self.steps[index];
            step.retry_count = attempt + 1;
            step.error = Some(error.clone());
            if attempt < max_retries {
                let backoff = Duration::from_secs(1u64 << attempt.min(16));
                tracing::debug!(
                    target: "strata::saga",
                    saga_id = %self.saga_id,
                    step = %name,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    error = %error,
                    "step attempt failed, backing off"
                );
                self.clock.sleep(backoff).await;
            } else {
                step.status = StepStatus::Failed;
                return Err(error);
            }
        }
        unreachable!("retry loop always returns");
    }

    /// Compensate completed steps in reverse completion order. A failing
    /// compensation is recorded on its step and does not stop the rollback
    /// of earlier steps. Returns the number of compensations invoked.
    async fn compensate(&mut self) -> usize {
        self.metrics.sagas_compensated += 1;
        let mut invoked = 0;

        let completed: Vec<(usize, serde_json::Value)> =
            self.completed.iter().rev().cloned().collect();
        for (index, result) in completed {
            let (action, timeout_secs, name) = {
                let step = &self.steps[index];
                (
                    Arc::clone(&step.def.action),
                    step.def.timeout_secs,
                    step.def.name.clone(),
                )
            };
            if !action.has_compensation() {
                continue;
            }
            self.steps[index].status = StepStatus::Compensating;
            invoked += 1;

            let outcome = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                action.compensate(&result),
            )
            .await;
            match outcome {
                Ok(Ok(())) => {
                    self.steps[index].status = StepStatus::Compensated;
                    self.metrics.steps_compensated += 1;
                }
                Ok(Err(e)) => {
                    self.steps[index].error = Some(format!("compensation failed: {}", e));
                    tracing::warn!(
                        target: "strata::saga",
                        saga_id = %self.saga_id,
                        step = %name,
                        error = %e,
                        "compensation failed, continuing rollback"
                    );
                }
                Err(_) => {
                    self.steps[index].error =
                        Some(format!("compensation timeout after {}s", timeout_secs));
                    tracing::warn!(
                        target: "strata::saga",
                        saga_id = %self.saga_id,
                        step = %name,
                        "compensation timed out, continuing rollback"
                    );
                }
            }
            self.save_checkpoint().await;
        }
        invoked
    }

    fn checkpoint_key(&self, saga_id: &str) -> String {
        format!("{}:{}", self.config.checkpoint_prefix, saga_id)
    }

    fn build_checkpoint(&self) -> SagaCheckpoint {
        let completed_steps = self
            .completed
            .iter()
            .map(|(index, _)| {
                let step = &self.steps[*index];
                StepCheckpoint {
                    name: step.def.name.clone(),
                    status: step.status,
                    retry_count: step.retry_count,
                    max_retries: step.def.max_retries,
                    timeout_secs: step.def.timeout_secs,
                    result: step.result.clone(),
                    error: step.error.clone(),
                    started_at: step.started_at,
                    completed_at: step.completed_at,
                }
            })
            .collect();
        let now = self.clock.now();
        SagaCheckpoint {
            saga_id: self.saga_id.clone(),
            state: self.state,
            current_step_index: self.current_step_index,
            completed_steps,
            context: self.context.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Persist the checkpoint. A write failure is logged and swallowed:
    /// availability over durability at this layer, the next successful
    /// write supersedes.
    async fn save_checkpoint(&self) {
        let checkpoint = self.build_checkpoint();
        let key = self.checkpoint_key(&self.saga_id);
        let encoded = match serde_json::to_string(&checkpoint) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(target: "strata::saga", saga_id = %self.saga_id, error = %e, "checkpoint encode failed");
                return;
            }
        };
        if let Err(e) = self
            .kv
            .set_ex(&key, &encoded, self.config.checkpoint_ttl_secs)
            .await
        {
            tracing::warn!(target: "strata::saga", saga_id = %self.saga_id, error = %e, "checkpoint write failed");
        }
    }

    /// Rehydrate state from the checkpoint for `saga_id`. Completed steps
    /// keep their recorded results for later compensation, but nothing is
    /// re-merged or replayed. The orchestrator must hold the same ordered
    /// step list that produced the checkpoint.
    pub async fn restore_from_checkpoint(&mut self, saga_id: &str) -> Result<bool, SagaError> {
        let key = self.checkpoint_key(saga_id);
        let Some(raw) = self.kv.get(&key).await? else {
            return Ok(false);
        };
        let checkpoint: SagaCheckpoint =
            serde_json::from_str(&raw).map_err(|e| SagaError::CheckpointDecode(e.to_string()))?;

        if checkpoint.completed_steps.len() > self.steps.len() {
            return Err(SagaError::CheckpointDecode(format!(
                "checkpoint has {} completed steps but only {} are bound",
                checkpoint.completed_steps.len(),
                self.steps.len()
            )));
        }
        for (index, saved) in checkpoint.completed_steps.iter().enumerate() {
            let bound = &self.steps[index].def.name;
            if bound != &saved.name {
                return Err(SagaError::StepMismatch {
                    index,
                    checkpoint: saved.name.clone(),
                    bound: bound.clone(),
                });
            }
        }

        self.saga_id = checkpoint.saga_id;
        self.state = checkpoint.state;
        self.current_step_index = checkpoint.current_step_index;
        self.context = checkpoint.context;
        self.completed = checkpoint
            .completed_steps
            .iter()
            .enumerate()
            .map(|(index, saved)| {
                (
                    index,
                    saved.result.clone().unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        for (index, saved) in checkpoint.completed_steps.iter().enumerate() {
            let step = &mut self.steps[index];
            step.status = saved.status;
            step.retry_count = saved.retry_count;
            step.result = saved.result.clone();
            step.error = saved.error.clone();
            step.started_at = saved.started_at;
            step.completed_at = saved.completed_at;
        }
        Ok(true)
    }

    pub fn status(&self) -> SagaStatus {
        SagaStatus {
            saga_id: self.saga_id.clone(),
            state: self.state,
            current_step: self.current_step_index,
            total_steps: self.steps.len(),
            completed_steps: self.completed.len(),
            steps: self
                .steps
                .iter()
                .map(|s| StepStatusLine {
                    name: s.def.name.clone(),
                    status: s.status,
                    retry_count: s.retry_count,
                    error: s.error.clone(),
                })
                .collect(),
        }
    }
}
