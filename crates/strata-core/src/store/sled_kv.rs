//! Durable `KvStore` over a sled database.
//!
//! sled has no native TTL, so each value is stored with its absolute expiry
//! (epoch milliseconds) and evicted lazily when a read finds it stale.

use super::{KvStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize)]
struct StoredValue {
    expires_at_ms: i64,
    value: String,
}

pub struct SledKvStore {
    db: sled::Db,
}

impl SledKvStore {
    /// Opens or creates the database at `path`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl KvStore for SledKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let Some(raw) = self
            .db
            .get(key.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?
        else {
            return Ok(None);
        };
        let stored: StoredValue = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Backend(format!("corrupt value for '{}': {}", key, e)))?;
        if Utc::now().timestamp_millis() >= stored.expires_at_ms {
            self.db
                .remove(key.as_bytes())
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            return Ok(None);
        }
        Ok(Some(stored.value))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let stored = StoredValue {
            expires_at_ms: Utc::now().timestamp_millis() + (ttl_secs as i64) * 1000,
            value: value.to_string(),
        };
        let raw = serde_json::to_vec(&stored).map_err(|e| StoreError::Backend(e.to_string()))?;
        self.db
            .insert(key.as_bytes(), raw)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}
