//! Priority task queue over an append-only log with consumer groups.
//!
//! Four fixed streams (`{prefix}_critical|_high|_normal|_low`), one consumer
//! group, at-least-once delivery. Failed tasks retry with the same task id
//! until `max_retries`, then land on a dead-letter stream. Workers that die
//! mid-task leave their messages in the pending set, where
//! [`TaskQueue::recover_pending`] can claim them after an idle timeout.

use crate::clock::Clock;
use crate::config::{env_string, env_u64, env_usize};
use crate::store::{KvStore, LogStore, StoreError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const TASK_FIELD: &str = "task_data";
const DLQ_MAX_LEN: u64 = 10_000;
const RESULT_TTL_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("log store error: {0}")]
    Store(#[from] StoreError),
    #[error("task encode failed: {0}")]
    Encode(String),
}

/// Task priority. Declaration order is ascending so `Ord` matches the
/// numeric weight of each level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub const ALL_DESCENDING: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// Numeric weight (CRITICAL=100, HIGH=75, NORMAL=50, LOW=25).
    pub fn weight(&self) -> u8 {
        match self {
            TaskPriority::Critical => 100,
            TaskPriority::High => 75,
            TaskPriority::Normal => 50,
            TaskPriority::Low => 25,
        }
    }

    fn stream_suffix(&self) -> &'static str {
        match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        }
    }
}

/// A unit of work on the queue. `task_id` is stable across retries; the
/// stream message id changes on every re-enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

/// Queue configuration.
///
/// | Env | Default | Description |
/// |-----|---------|-------------|
/// | STRATA_QUEUE_STREAM_PREFIX | strata_tasks | Names the four priority streams and the DLQ. |
/// | STRATA_QUEUE_CONSUMER_GROUP | strata_workers | Single consumer group created on connect. |
/// | STRATA_QUEUE_MAX_STREAM_LENGTH | 100000 | Approximate per-stream cap. |
/// | STRATA_QUEUE_PENDING_TIMEOUT_MS | 300000 | Idle threshold for pending recovery. |
/// | STRATA_QUEUE_POLL_INTERVAL_MS | 100 | Block window of one consume poll. |
/// | STRATA_QUEUE_BATCH_SIZE | 10 | Max messages per poll. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    pub stream_prefix: String,
    pub consumer_group: String,
    pub max_stream_length: u64,
    pub pending_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "strata_tasks".to_string(),
            consumer_group: "strata_workers".to_string(),
            max_stream_length: 100_000,
            pending_timeout_ms: 300_000,
            poll_interval_ms: 100,
            batch_size: 10,
        }
    }
}

impl TaskQueueConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            stream_prefix: env_string("STRATA_QUEUE_STREAM_PREFIX", &d.stream_prefix),
            consumer_group: env_string("STRATA_QUEUE_CONSUMER_GROUP", &d.consumer_group),
            max_stream_length: env_u64("STRATA_QUEUE_MAX_STREAM_LENGTH", d.max_stream_length),
            pending_timeout_ms: env_u64("STRATA_QUEUE_PENDING_TIMEOUT_MS", d.pending_timeout_ms),
            poll_interval_ms: env_u64("STRATA_QUEUE_POLL_INTERVAL_MS", d.poll_interval_ms),
            batch_size: env_usize("STRATA_QUEUE_BATCH_SIZE", d.batch_size),
        }
    }
}

#[derive(Debug, Default)]
struct QueueMetrics {
    tasks_added: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_recovered: AtomicU64,
}

/// Snapshot of the queue counters. A retry re-enqueue counts as a new add.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    pub tasks_added: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_recovered: u64,
}

/// Per-stream statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StreamStats {
    pub length: u64,
    pub pending: u64,
    pub consumers: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    /// Keyed by priority name (`critical`, `high`, `normal`, `low`).
    pub priorities: HashMap<String, StreamStats>,
    pub dead_letter_length: u64,
}

/// Priority task queue instance. Cheap to share behind an `Arc`; the
/// message-id-to-stream map it keeps for ACKs is per instance, so the worker
/// that consumed a message should be the one completing or failing it.
pub struct TaskQueue {
    config: TaskQueueConfig,
    log: Arc<dyn LogStore>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    dlq_stream: String,
    /// message id -> stream, recorded on delivery, removed on ACK.
    message_streams: DashMap<String, String>,
    metrics: QueueMetrics,
}

impl TaskQueue {
    pub fn new(
        config: TaskQueueConfig,
        log: Arc<dyn LogStore>,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let dlq_stream = format!("{}_dlq", config.stream_prefix);
        Self {
            config,
            log,
            kv,
            clock,
            dlq_stream,
            message_streams: DashMap::new(),
            metrics: QueueMetrics::default(),
        }
    }

    fn stream_for(&self, priority: TaskPriority) -> String {
        format!("{}_{}", self.config.stream_prefix, priority.stream_suffix())
    }

    /// Create the consumer group on every priority stream. Idempotent;
    /// an already-existing group is success.
    pub async fn connect(&self) -> Result<(), QueueError> {
        for priority in TaskPriority::ALL_DESCENDING {
            self.log
                .ensure_group(&self.stream_for(priority), &self.config.consumer_group)
                .await?;
        }
        Ok(())
    }

    /// Enqueue a new task with default retry/timeout settings.
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        priority: TaskPriority,
    ) -> Result<String, QueueError> {
        self.enqueue_task(Task {
            task_id: Uuid::new_v4().to_string(),
            task_type: task_type.to_string(),
            payload,
            priority,
            created_at: self.clock.now(),
            retry_count: 0,
            max_retries: 3,
            timeout_secs: 300,
        })
        .await
    }

    /// Enqueue a fully specified task. Used for retries (same `task_id`,
    /// bumped `retry_count`) and by callers that need custom limits.
    pub async fn enqueue_task(&self, task: Task) -> Result<String, QueueError> {
        let stream = self.stream_for(task.priority);
        let encoded =
            serde_json::to_string(&task).map_err(|e| QueueError::Encode(e.to_string()))?;
        let fields = HashMap::from([(TASK_FIELD.to_string(), encoded)]);
        self.log
            .append(&stream, fields, Some(self.config.max_stream_length))
            .await?;
        self.metrics.tasks_added.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            target: "strata::queue",
            task_id = %task.task_id,
            task_type = %task.task_type,
            priority = task.priority.weight(),
            retry = task.retry_count,
            "task enqueued"
        );
        Ok(task.task_id)
    }

    /// One consume poll: blocks up to `poll_interval_ms`, returns whatever is
    /// available with higher priorities always first. Empty result means
    /// nothing was ready this interval.
    pub async fn poll(
        &self,
        worker_id: &str,
        priorities: Option<&[TaskPriority]>,
    ) -> Result<Vec<(String, Task)>, QueueError> {
        let mut wanted: Vec<TaskPriority> = priorities
            .map(|p| p.to_vec())
            .unwrap_or_else(|| TaskPriority::ALL_DESCENDING.to_vec());
        wanted.sort_by(|a, b| b.cmp(a));
        wanted.dedup();
        let streams: Vec<String> = wanted.iter().map(|p| self.stream_for(*p)).collect();

        let read = self
            .log
            .read_group(
                &self.config.consumer_group,
                worker_id,
                &streams,
                self.config.batch_size,
                self.config.poll_interval_ms,
            )
            .await?;

        let mut out = Vec::new();
        for (stream, messages) in read {
            for (message_id, fields) in messages {
                self.message_streams
                    .insert(message_id.clone(), stream.clone());
                let Some(raw) = fields.get(TASK_FIELD) else {
                    tracing::warn!(target: "strata::queue", %message_id, "message without task data, dropping");
                    self.discard(&message_id).await;
                    continue;
                };
                match serde_json::from_str::<Task>(raw) {
                    Ok(task) => out.push((message_id, task)),
                    Err(e) => {
                        tracing::warn!(target: "strata::queue", %message_id, error = %e, "undecodable task, dropping");
                        self.discard(&message_id).await;
                    }
                }
            }
        }
        Ok(out)
    }

    /// Run a worker loop: poll, hand each task to `handler`, complete on
    /// `Ok` (storing any returned result) and fail on `Err`. Transient store
    /// errors are logged and retried after a short pause; the loop never
    /// exits on its own.
    pub async fn run_worker<F, Fut>(&self, worker_id: &str, handler: F)
    where
        F: Fn(Task) -> Fut,
        Fut: std::future::Future<Output = Result<Option<serde_json::Value>, String>>,
    {
        loop {
            let batch = match self.poll(worker_id, None).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(target: "strata::queue", worker = worker_id, error = %e, "consume error");
                    self.clock.sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            for (message_id, task) in batch {
                match handler(task.clone()).await {
                    Ok(result) => {
                        if let Err(e) = self.complete(&message_id, result).await {
                            tracing::error!(target: "strata::queue", %message_id, error = %e, "complete failed");
                        }
                    }
                    Err(reason) => {
                        if let Err(e) = self.fail(&message_id, &reason, Some(&task)).await {
                            tracing::error!(target: "strata::queue", %message_id, error = %e, "fail failed");
                        }
                    }
                }
            }
        }
    }

    /// ACK and delete a finished message. An optional result is cached in
    /// the key/value store under `taskResult:{message_id}` for one hour.
    pub async fn complete(
        &self,
        message_id: &str,
        result: Option<serde_json::Value>,
    ) -> Result<(), QueueError> {
        let stream = self.take_stream(message_id);
        self.log
            .ack(&stream, &self.config.consumer_group, message_id)
            .await?;
        self.log.del(&stream, message_id).await?;

        if let Some(result) = result {
            let key = format!("taskResult:{}", message_id);
            let encoded =
                serde_json::to_string(&result).map_err(|e| QueueError::Encode(e.to_string()))?;
            self.kv.set_ex(&key, &encoded, RESULT_TTL_SECS).await?;
        }
        self.metrics.tasks_completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record a failure. Below `max_retries` the task is re-enqueued on the
    /// same priority stream with the same `task_id`; otherwise it goes to
    /// the dead-letter stream. The original message is ACKed either way.
    pub async fn fail(
        &self,
        message_id: &str,
        error: &str,
        task: Option<&Task>,
    ) -> Result<(), QueueError> {
        match task {
            Some(task) if task.retry_count < task.max_retries => {
                let mut retry = task.clone();
                retry.retry_count += 1;
                tracing::info!(
                    target: "strata::queue",
                    task_id = %retry.task_id,
                    retry = retry.retry_count,
                    max = retry.max_retries,
                    "task failed, re-enqueueing"
                );
                self.enqueue_task(retry).await?;
            }
            _ => {
                let task_data = task
                    .map(|t| serde_json::to_string(t).unwrap_or_default())
                    .unwrap_or_default();
                let fields = HashMap::from([
                    (
                        "original_message_id".to_string(),
                        message_id.to_string(),
                    ),
                    ("error".to_string(), error.to_string()),
                    ("task_data".to_string(), task_data),
                    ("failed_at".to_string(), self.clock.now().to_rfc3339()),
                ]);
                self.log
                    .append(&self.dlq_stream, fields, Some(DLQ_MAX_LEN))
                    .await?;
                tracing::warn!(
                    target: "strata::queue",
                    %message_id,
                    error,
                    "retries exhausted, task moved to dead-letter stream"
                );
            }
        }
        self.metrics.tasks_failed.fetch_add(1, Ordering::Relaxed);

        let stream = self.take_stream(message_id);
        self.log
            .ack(&stream, &self.config.consumer_group, message_id)
            .await?;
        self.log.del(&stream, message_id).await?;
        Ok(())
    }

    /// Claim messages stuck in the pending set longer than
    /// `pending_timeout_ms` for `worker_id`. Returns how many were claimed.
    pub async fn recover_pending(&self, worker_id: &str) -> Result<u64, QueueError> {
        let mut recovered = 0;
        for priority in TaskPriority::ALL_DESCENDING {
            let stream = self.stream_for(priority);
            let pending = self
                .log
                .pending_range(&stream, &self.config.consumer_group, "-", "+", 100)
                .await?;
            for entry in pending {
                if entry.idle_ms <= self.config.pending_timeout_ms {
                    continue;
                }
                let claimed = self
                    .log
                    .claim(
                        &stream,
                        &self.config.consumer_group,
                        worker_id,
                        self.config.pending_timeout_ms,
                        &[entry.message_id.clone()],
                    )
                    .await?;
                if !claimed.is_empty() {
                    self.message_streams
                        .insert(entry.message_id.clone(), stream.clone());
                    recovered += 1;
                    self.metrics.tasks_recovered.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        target: "strata::queue",
                        message_id = %entry.message_id,
                        worker = worker_id,
                        idle_ms = entry.idle_ms,
                        "claimed stuck task"
                    );
                }
            }
        }
        Ok(recovered)
    }

    /// Per-priority stream statistics plus the dead-letter length. Streams
    /// that do not exist yet report zeros.
    pub async fn stats(&self) -> QueueStats {
        let mut priorities = HashMap::new();
        for priority in TaskPriority::ALL_DESCENDING {
            let stream = self.stream_for(priority);
            let length = self.log.len(&stream).await.unwrap_or(0);
            let info = self
                .log
                .group_info(&stream, &self.config.consumer_group)
                .await
                .unwrap_or_default();
            priorities.insert(
                priority.stream_suffix().to_string(),
                StreamStats {
                    length,
                    pending: info.pending,
                    consumers: info.consumers,
                },
            );
        }
        QueueStats {
            priorities,
            dead_letter_length: self.log.len(&self.dlq_stream).await.unwrap_or(0),
        }
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            tasks_added: self.metrics.tasks_added.load(Ordering::Relaxed),
            tasks_completed: self.metrics.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.metrics.tasks_failed.load(Ordering::Relaxed),
            tasks_recovered: self.metrics.tasks_recovered.load(Ordering::Relaxed),
        }
    }

    /// Resolve and forget the stream a message was delivered from. Falls
    /// back to the NORMAL stream when the mapping is already gone.
    fn take_stream(&self, message_id: &str) -> String {
        self.message_streams
            .remove(message_id)
            .map(|(_, stream)| stream)
            .unwrap_or_else(|| self.stream_for(TaskPriority::Normal))
    }

    /// Drop an undecodable message so it is not redelivered forever.
    async fn discard(&self, message_id: &str) {
        let stream = self.take_stream(message_id);
        let _ = self
            .log
            .ack(&stream, &self.config.consumer_group, message_id)
            .await;
        let _ = self.log.del(&stream, message_id).await;
    }
}
