//! Append-only, capacity-bounded audit trail of security-relevant actions.
//!
//! Writes never block the caller on transport: entries land in an in-memory
//! ring and are optionally forwarded over an unbounded channel for
//! asynchronous shipment. When the ring exceeds its capacity the oldest
//! entries are dropped.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// Audited action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    KeyCreate,
    KeyRetrieve,
    KeyEncrypt,
    KeyDecrypt,
    KeyRotate,
    KeyDelete,
    KeyList,
    CacheHit,
    CacheMiss,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub entry_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Key or resource the action touched.
    pub subject_id: String,
    pub user_id: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// Query filter for [`AuditLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub subject_id: Option<String>,
    pub action: Option<AuditAction>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditStatistics {
    pub total_entries: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub by_action: HashMap<String, u64>,
}

pub struct AuditLog {
    entries: Mutex<VecDeque<AuditLogEntry>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
    forwarder: Option<mpsc::UnboundedSender<AuditLogEntry>>,
}

impl AuditLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY, clock)
    }

    pub fn with_capacity(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
            clock,
            forwarder: None,
        }
    }

    /// Forward every recorded entry over a channel for asynchronous
    /// shipment. A closed receiver is ignored; recording never fails.
    pub fn with_forwarder(mut self, sender: mpsc::UnboundedSender<AuditLogEntry>) -> Self {
        self.forwarder = Some(sender);
        self
    }

    /// Record a successful action.
    pub fn record(&self, action: AuditAction, subject_id: &str) -> String {
        self.push(action, subject_id, None, true, None, Default::default())
    }

    /// Record a failed action with its error text.
    pub fn record_failure(&self, action: AuditAction, subject_id: &str, error: &str) -> String {
        self.push(
            action,
            subject_id,
            None,
            false,
            Some(error.to_string()),
            Default::default(),
        )
    }

    /// Record with full control over the entry fields. Returns the entry id.
    pub fn push(
        &self,
        action: AuditAction,
        subject_id: &str,
        user_id: Option<String>,
        success: bool,
        error_message: Option<String>,
        details: serde_json::Map<String, serde_json::Value>,
    ) -> String {
        let entry = AuditLogEntry {
            entry_id: Uuid::new_v4().to_string(),
            timestamp: self.clock.now(),
            action,
            subject_id: subject_id.to_string(),
            user_id,
            success,
            error_message,
            details,
        };
        let id = entry.entry_id.clone();
        {
            let mut entries = self.entries.lock().unwrap();
            entries.push_back(entry.clone());
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
        if let Some(sender) = &self.forwarder {
            let _ = sender.send(entry);
        }
        id
    }

    /// Newest-first query over the ring.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditLogEntry> {
        let entries = self.entries.lock().unwrap();
        let limit = query.limit.unwrap_or(usize::MAX);
        entries
            .iter()
            .rev()
            .filter(|e| {
                query
                    .subject_id
                    .as_ref()
                    .is_none_or(|id| &e.subject_id == id)
                    && query.action.is_none_or(|a| e.action == a)
                    && query.since.is_none_or(|t| e.timestamp >= t)
                    && query.until.is_none_or(|t| e.timestamp <= t)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn statistics(&self) -> AuditStatistics {
        let entries = self.entries.lock().unwrap();
        let total = entries.len() as u64;
        let successes = entries.iter().filter(|e| e.success).count() as u64;
        let mut by_action: HashMap<String, u64> = HashMap::new();
        for entry in entries.iter() {
            let key = serde_json::to_string(&entry.action)
                .unwrap_or_default()
                .trim_matches('"')
                .to_string();
            *by_action.entry(key).or_insert(0) += 1;
        }
        AuditStatistics {
            total_entries: total,
            successes,
            failures: total - successes,
            success_rate: if total > 0 {
                successes as f64 / total as f64
            } else {
                0.0
            },
            by_action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn log() -> AuditLog {
        AuditLog::new(Arc::new(SystemClock))
    }

    #[test]
    fn ring_drops_oldest_beyond_capacity() {
        let log = AuditLog::with_capacity(3, Arc::new(SystemClock));
        for i in 0..5 {
            log.record(AuditAction::KeyEncrypt, &format!("key-{}", i));
        }
        assert_eq!(log.len(), 3);
        let all = log.query(&AuditQuery::default());
        assert_eq!(all[0].subject_id, "key-4");
        assert_eq!(all[2].subject_id, "key-2");
    }

    #[test]
    fn query_filters_by_action_and_subject() {
        let log = log();
        log.record(AuditAction::KeyCreate, "k1");
        log.record(AuditAction::KeyEncrypt, "k1");
        log.record(AuditAction::KeyEncrypt, "k2");
        log.record_failure(AuditAction::Error, "k2", "boom");

        let encrypts = log.query(&AuditQuery {
            action: Some(AuditAction::KeyEncrypt),
            ..Default::default()
        });
        assert_eq!(encrypts.len(), 2);

        let k2 = log.query(&AuditQuery {
            subject_id: Some("k2".to_string()),
            ..Default::default()
        });
        assert_eq!(k2.len(), 2);
        assert!(!k2[0].success);
    }

    #[test]
    fn statistics_count_success_rate() {
        let log = log();
        log.record(AuditAction::KeyCreate, "k");
        log.record(AuditAction::KeyDecrypt, "k");
        log.record_failure(AuditAction::KeyDecrypt, "k", "bad key");
        let stats = log.statistics();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.failures, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.by_action["key_decrypt"], 2);
    }

    #[tokio::test]
    async fn forwarder_receives_entries() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log = AuditLog::new(Arc::new(SystemClock)).with_forwarder(tx);
        log.record(AuditAction::KeyRotate, "k");
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.action, AuditAction::KeyRotate);
    }
}
