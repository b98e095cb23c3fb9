//! Authenticated symmetric encryption for secrets at rest.
//!
//! AES-256-GCM keyed by a PBKDF2-HMAC-SHA256 derivation of a master
//! password (fixed deployment-scoped salt, 100k iterations). Each blob is
//! `[12-byte nonce || ciphertext+tag]`; the string form is base64 of that
//! blob. The encryptor is stateless after construction.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
/// Deployment-scoped KDF salt. Fixed so every process of a deployment
/// derives the same key from the same master password.
const KDF_SALT: &[u8] = b"strata_control_plane_v1";
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
/// Env var holding the master password.
pub const ENV_MASTER_PASSWORD: &str = "STRATA_MASTER_PASSWORD";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no master password: set {ENV_MASTER_PASSWORD}")]
    NoMasterPassword,
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("corrupt blob (too short)")]
    CorruptBlob,
    #[error("ciphertext encoding invalid: {0}")]
    Encoding(String),
    #[error("decrypted bytes are not valid UTF-8")]
    Utf8,
}

/// Symmetric authenticated encryptor bound to one derived key.
pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl Encryptor {
    /// Derive the process key from a master password with the given PBKDF2
    /// iteration count (use [`DEFAULT_KDF_ITERATIONS`] in production).
    pub fn from_password(password: &str, iterations: u32) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(password.as_bytes(), KDF_SALT, iterations, &mut key);
        let cipher = Aes256Gcm::new_from_slice(&key).expect("key length is 32");
        Self { cipher }
    }

    /// Read the master password from [`ENV_MASTER_PASSWORD`]. A missing or
    /// empty password is an explicit error: silently generating a random
    /// key would make every persisted secret unreadable after restart.
    pub fn from_env() -> Result<Self, VaultError> {
        let password = std::env::var(ENV_MASTER_PASSWORD)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(VaultError::NoMasterPassword)?;
        Ok(Self::from_password(&password, DEFAULT_KDF_ITERATIONS))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(nonce.as_slice());
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, VaultError> {
        if blob.len() < NONCE_LEN {
            return Err(VaultError::CorruptBlob);
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| VaultError::DecryptionFailed(e.to_string()))
    }

    /// Encrypt a string to the base64 on-disk form.
    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, VaultError> {
        Ok(URL_SAFE_NO_PAD.encode(self.encrypt(plaintext.as_bytes())?))
    }

    /// Decrypt the base64 on-disk form back to a string.
    pub fn decrypt_str(&self, encoded: &str) -> Result<String, VaultError> {
        let blob = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| VaultError::Encoding(e.to_string()))?;
        String::from_utf8(self.decrypt(&blob)?).map_err(|_| VaultError::Utf8)
    }
}
