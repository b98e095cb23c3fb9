//! Encrypted per-service API-key pool.
//!
//! Keys live in memory in the clear (the router needs them per request) and
//! on disk as a JSON object `{service: [ciphertext, ...]}` where each
//! ciphertext is the encryptor's base64 blob. The file is written through a
//! temp file and an atomic rename so a crash never leaves half a pool.

use crate::router::ReliabilityRouter;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_core::{AuditAction, AuditLog, Encryptor, VaultError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("key file is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct KeyPoolStatus {
    pub services: HashMap<String, usize>,
    pub file_exists: bool,
}

pub struct KeyManager {
    path: PathBuf,
    encryptor: Encryptor,
    pool: DashMap<String, Vec<String>>,
    audit: Option<Arc<AuditLog>>,
}

impl KeyManager {
    pub fn new(path: impl Into<PathBuf>, encryptor: Encryptor) -> Self {
        Self {
            path: path.into(),
            encryptor,
            pool: DashMap::new(),
            audit: None,
        }
    }

    /// Record key operations (add, rotate, load, failures) in the audit
    /// trail.
    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    fn audit_ok(&self, action: AuditAction, subject: &str) {
        if let Some(audit) = &self.audit {
            audit.record(action, subject);
        }
    }

    fn audit_err(&self, action: AuditAction, subject: &str, error: &str) {
        if let Some(audit) = &self.audit {
            audit.record_failure(action, subject, error);
        }
    }

    pub fn add_key(&self, service: &str, api_key: &str) {
        let mut keys = self.pool.entry(service.to_string()).or_default();
        keys.push(api_key.to_string());
        tracing::info!(
            target: "strata::keys",
            service,
            total = keys.len(),
            "key added to pool"
        );
        drop(keys);
        self.audit_ok(AuditAction::KeyCreate, service);
    }

    pub fn keys(&self, service: &str) -> Vec<String> {
        self.pool
            .get(service)
            .map(|keys| keys.clone())
            .unwrap_or_default()
    }

    /// Replace a service's keys and persist immediately.
    pub fn rotate(&self, service: &str, new_keys: Vec<String>) -> Result<(), KeyStoreError> {
        let old = self
            .pool
            .insert(service.to_string(), new_keys.clone())
            .map(|keys| keys.len())
            .unwrap_or(0);
        tracing::info!(
            target: "strata::keys",
            service,
            from = old,
            to = new_keys.len(),
            "keys rotated"
        );
        self.audit_ok(AuditAction::KeyRotate, service);
        self.save()
    }

    /// Encrypt the pool and write it to disk atomically.
    pub fn save(&self) -> Result<(), KeyStoreError> {
        // BTreeMap for a stable on-disk ordering.
        let mut encrypted: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in self.pool.iter() {
            let ciphertexts = entry
                .value()
                .iter()
                .map(|key| self.encryptor.encrypt_str(key))
                .collect::<Result<Vec<_>, _>>()?;
            encrypted.insert(entry.key().clone(), ciphertexts);
        }
        let json = serde_json::to_string_pretty(&encrypted)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        tracing::info!(
            target: "strata::keys",
            path = %self.path.display(),
            services = encrypted.len(),
            "encrypted key pool saved"
        );
        Ok(())
    }

    /// Load and decrypt the pool from disk. A missing file is not an error;
    /// returns whether anything was loaded.
    pub fn load(&self) -> Result<bool, KeyStoreError> {
        if !self.path.exists() {
            tracing::warn!(
                target: "strata::keys",
                path = %self.path.display(),
                "key file not found"
            );
            return Ok(false);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let encrypted: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw)?;
        for (service, ciphertexts) in encrypted {
            let keys = match ciphertexts
                .iter()
                .map(|c| self.encryptor.decrypt_str(c))
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(keys) => keys,
                Err(e) => {
                    self.audit_err(AuditAction::KeyDecrypt, &service, &e.to_string());
                    return Err(e.into());
                }
            };
            self.audit_ok(AuditAction::KeyRetrieve, &service);
            self.pool.insert(service, keys);
        }
        tracing::info!(
            target: "strata::keys",
            path = %self.path.display(),
            "encrypted key pool loaded"
        );
        Ok(true)
    }

    /// Feed every pooled key into the router's rotation rings. Call at
    /// startup after [`Self::load`].
    pub fn load_into(&self, router: &ReliabilityRouter) {
        for entry in self.pool.iter() {
            for key in entry.value() {
                router.add_key(entry.key(), key);
            }
        }
    }

    pub fn status(&self) -> KeyPoolStatus {
        KeyPoolStatus {
            services: self
                .pool
                .iter()
                .map(|e| (e.key().clone(), e.value().len()))
                .collect(),
            file_exists: self.path.exists(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor() -> Encryptor {
        Encryptor::from_password("test-master", 10)
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let manager = KeyManager::new(&path, encryptor());
        manager.add_key("deepseek", "sk-a");
        manager.add_key("deepseek", "sk-b");
        manager.add_key("perplexity", "pplx-1");
        manager.save().unwrap();

        // Ciphertext on disk, not plaintext.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("sk-a"));
        assert!(raw.contains("deepseek"));

        let restored = KeyManager::new(&path, encryptor());
        assert!(restored.load().unwrap());
        assert_eq!(restored.keys("deepseek"), vec!["sk-a", "sk-b"]);
        assert_eq!(restored.keys("perplexity"), vec!["pplx-1"]);
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = KeyManager::new(dir.path().join("absent.json"), encryptor());
        assert!(!manager.load().unwrap());
        assert!(manager.keys("deepseek").is_empty());
    }

    #[test]
    fn rotate_replaces_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let manager = KeyManager::new(&path, encryptor());
        manager.add_key("deepseek", "old-key");
        manager.save().unwrap();

        manager
            .rotate("deepseek", vec!["new-1".to_string(), "new-2".to_string()])
            .unwrap();

        let restored = KeyManager::new(&path, encryptor());
        restored.load().unwrap();
        assert_eq!(restored.keys("deepseek"), vec!["new-1", "new-2"]);
    }

    #[test]
    fn wrong_master_password_fails_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let manager = KeyManager::new(&path, encryptor());
        manager.add_key("deepseek", "sk-secret");
        manager.save().unwrap();

        let wrong = KeyManager::new(&path, Encryptor::from_password("not-it", 10));
        assert!(matches!(wrong.load(), Err(KeyStoreError::Vault(_))));
    }

    #[test]
    fn audit_trail_records_key_operations() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(AuditLog::new(Arc::new(strata_core::SystemClock)));
        let manager = KeyManager::new(dir.path().join("keys.json"), encryptor())
            .with_audit(audit.clone());

        manager.add_key("deepseek", "sk-1");
        manager
            .rotate("deepseek", vec!["sk-2".to_string()])
            .unwrap();

        let stats = audit.statistics();
        assert_eq!(stats.by_action["key_create"], 1);
        assert_eq!(stats.by_action["key_rotate"], 1);
    }

    #[test]
    fn status_reports_pool_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        let manager = KeyManager::new(&path, encryptor());
        manager.add_key("deepseek", "k");
        let status = manager.status();
        assert_eq!(status.services["deepseek"], 1);
        assert!(!status.file_exists);
    }
}
