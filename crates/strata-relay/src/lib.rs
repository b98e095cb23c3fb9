//! strata-relay: the AI-provider bridge of the control plane.
//!
//! Requests go to a co-hosted primary aggregation service; on repeated
//! failure the [`ReliabilityRouter`] opens its circuit and falls back to
//! calling upstream providers directly, rotating through an encrypted
//! per-service credential pool. The [`SelfHealingMonitor`] probes the
//! primary, nudges the router back once it recovers, and auto-restarts it
//! within a bounded budget.

pub mod gateway;
pub mod keys;
pub mod monitor;
pub mod router;

pub use gateway::{GatewayError, HttpGateway, ReqwestGateway};
pub use keys::{KeyManager, KeyPoolStatus, KeyStoreError};
pub use monitor::{
    MonitorConfig, MonitorHealth, MonitorMetricsSnapshot, PrimaryAutoStart, SelfHealingMonitor,
};
pub use router::{
    AiRequest, ReliabilityRouter, RouterConfig, RouterError, RouterMetricsSnapshot, RouterMode,
    RouterSnapshot, ServiceProfile, UnifiedResponse,
};
