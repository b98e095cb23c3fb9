//! strata-core: control-plane core for the backtesting/agent platform.
//!
//! Holds the subsystems every worker process composes at startup: the
//! priority task queue over an append-only log, the saga orchestrator with
//! durable checkpoints, the per-strategy isolation manager, and the ambient
//! pieces they share (clock, stores, encryptor, audit log, alert bus).
//!
//! External collaborators are traits (`LogStore`, `KvStore`, `Clock`,
//! `Notifier`) with in-memory implementations for tests and embeddings.

pub mod alert;
pub mod audit;
pub mod clock;
pub mod config;
pub mod isolation;
pub mod queue;
pub mod saga;
pub mod store;
pub mod vault;

pub use alert::{Alert, AlertBus, AlertBusConfig, AlertLevel, MemoryNotifier, Notifier, NotifyError};
pub use audit::{AuditAction, AuditLog, AuditLogEntry, AuditQuery, AuditStatistics};
pub use clock::{Clock, ManualClock, SystemClock};
pub use isolation::{
    IsolationConfig, IsolationError, IsolationLevel, IsolationManager, IsolationStatus,
    ResourceQuota, ResourceUsage, StrategyContext, StrategyState, TradeGuard,
};
pub use queue::{
    QueueError, QueueMetricsSnapshot, QueueStats, StreamStats, Task, TaskPriority, TaskQueue,
    TaskQueueConfig,
};
pub use saga::{
    SagaAction, SagaCheckpoint, SagaConfig, SagaError, SagaMetricsSnapshot, SagaOrchestrator,
    SagaOutcome, SagaReport, SagaState, SagaStatus, SagaStep, StepCheckpoint, StepStatus,
};
pub use store::{
    GroupInfo, KvStore, LogStore, MemoryKvStore, MemoryLogStore, PendingEntry, SledKvStore,
    StoreError,
};
pub use vault::{Encryptor, VaultError, ENV_MASTER_PASSWORD};
