//! Storage interfaces the control plane is written against.
//!
//! `LogStore` models append-only streams with consumer groups (the task
//! queue substrate); `KvStore` models a TTL key/value store (saga
//! checkpoints, task-result cache). Both ship with in-memory
//! implementations; `SledKvStore` adds a durable key/value option.

mod memory;
mod sled_kv;

pub use memory::{MemoryKvStore, MemoryLogStore};
pub use sled_kv::SledKvStore;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("unknown stream: {0}")]
    UnknownStream(String),
    #[error("unknown group '{group}' on stream '{stream}'")]
    UnknownGroup { stream: String, group: String },
}

/// One message delivered from a stream: `(message id, fields)`.
pub type DeliveredMessage = (String, HashMap<String, String>);

/// A message delivered to a consumer but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub message_id: String,
    pub consumer: String,
    pub idle_ms: u64,
    pub deliveries: u32,
}

/// Consumer-group counters for one stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupInfo {
    pub pending: u64,
    pub consumers: u64,
}

/// Append-only streams with consumer groups, ACK, pending inspection and
/// claim. Semantics follow the log-store the queue was designed against:
/// per-stream FIFO, each message delivered to exactly one consumer within a
/// group, unacked messages claimable after an idle timeout.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append fields to a stream, creating it if needed. `max_len` is a soft
    /// cap: the backend may trim approximately. Returns the message id.
    async fn append(
        &self,
        stream: &str,
        fields: HashMap<String, String>,
        max_len: Option<u64>,
    ) -> Result<String, StoreError>;

    /// Create the consumer group if it does not exist. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StoreError>;

    /// Read up to `count` new messages for `consumer`, asking the streams in
    /// the order given and returning whatever is available from the earliest
    /// stream that has data. Blocks up to `block_ms` when nothing is ready.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<(String, Vec<DeliveredMessage>)>, StoreError>;

    /// Acknowledge a delivered message, removing it from the pending set.
    /// Returns the number of messages acked (0 if it was not pending).
    async fn ack(&self, stream: &str, group: &str, message_id: &str) -> Result<u64, StoreError>;

    /// Delete a message from the stream. Returns the number deleted.
    async fn del(&self, stream: &str, message_id: &str) -> Result<u64, StoreError>;

    /// Inspect the pending set of a group, oldest first, bounded by message
    /// ids (`"-"` and `"+"` are the open bounds).
    async fn pending_range(
        &self,
        stream: &str,
        group: &str,
        min: &str,
        max: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    /// Transfer ownership of pending messages idle for at least
    /// `min_idle_ms` to `consumer`. Returns the ids actually claimed.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        message_ids: &[String],
    ) -> Result<Vec<String>, StoreError>;

    /// Number of entries currently in the stream.
    async fn len(&self, stream: &str) -> Result<u64, StoreError>;

    /// Pending/consumer counters for a group.
    async fn group_info(&self, stream: &str, group: &str) -> Result<GroupInfo, StoreError>;
}

/// TTL-indexed key/value store. Atomic single-key operations are sufficient
/// for everything the core persists.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}
