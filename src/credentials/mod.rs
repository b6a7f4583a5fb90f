//! Secret vault for connector credentials.
//!
//! Credentials are sealed with AES-256-GCM under a key derived once from the
//! deployment's master secret. Sealed blobs are what the persistence layer
//! stores; plaintext only exists inside a live backend client.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       SecretVault                        │
//! │  - encrypt / decrypt strings             │
//! │  - encrypt / decrypt structured maps     │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (seal)               (open)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - PBKDF2-HMAC-SHA256 key derivation     │
//! │  - AES-256-GCM, 128-bit IV per blob      │
//! │  - key-version tag                       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use conduit::credentials::{mask, SecretVault};
//! use serde_json::json;
//!
//! # fn main() -> conduit::error::Result<()> {
//! let secret = std::env::var("CONDUIT_MASTER_SECRET").unwrap_or_default();
//! let vault = SecretVault::new(&secret)?;
//!
//! let blob = vault.encrypt_structured(&json!({"apiKey": "sk_live_abcdef123456"}))?;
//! let creds: serde_json::Value = vault.decrypt_structured(&blob)?;
//! println!("api key: {}", mask(creds["apiKey"].as_str().unwrap_or(""), 4));
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - Fresh random IV per blob (never reused)
//! - Authenticated encryption: tampering fails closed with `DecryptionFailed`
//! - Blobs sealed under another key are rejected by key version before decryption
//! - The raw master secret is never stored; only the derived key is held in memory

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::config::VaultConfig;
use crate::error::{ConnectorError, Result};

mod encryption;
mod mask;

pub use encryption::{derive_key, key_version, IV_SIZE, KEY_SIZE, MIN_ITERATIONS, TAG_SIZE};
pub use mask::{constant_time_eq, mask};

/// Authenticated encryption for credential values.
///
/// Cheap to share behind an `Arc`; encryption and decryption take `&self`.
pub struct SecretVault {
    cipher: encryption::Cipher,
    key_version: String,
}

impl SecretVault {
    /// Creates a vault from the master secret with default derivation settings.
    pub fn new(master_secret: &str) -> Result<Self> {
        Self::with_config(master_secret, &VaultConfig::default())
    }

    /// Creates a vault from the master secret with explicit derivation settings.
    pub fn with_config(master_secret: &str, config: &VaultConfig) -> Result<Self> {
        let key = derive_key(master_secret, &config.salt, config.iterations)?;
        let vault = Self::from_key(key)?;
        debug!(
            iterations = config.iterations,
            key_version = %vault.key_version,
            "Secret vault key derived"
        );
        Ok(vault)
    }

    /// Reads the master secret from the environment variable named in `config`.
    ///
    /// A missing or empty secret is a fatal startup error.
    pub fn from_env(config: &VaultConfig) -> Result<Self> {
        let secret = std::env::var(&config.secret_env).map_err(|_| {
            ConnectorError::Validation(format!("{} is required", config.secret_env))
        })?;
        Self::with_config(&secret, config)
    }

    /// Creates a vault from an already-derived 256-bit key.
    pub fn from_key(key: [u8; KEY_SIZE]) -> Result<Self> {
        Ok(Self {
            cipher: encryption::cipher_for(&key)?,
            key_version: key_version(&key),
        })
    }

    /// Key-version tag carried in every blob this vault produces.
    pub fn key_version(&self) -> &str {
        &self.key_version
    }

    /// Encrypts a string into a blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        encryption::seal(&self.cipher, &self.key_version, plaintext.as_bytes())
    }

    /// Decrypts a blob back into a string.
    pub fn decrypt(&self, blob: &str) -> Result<String> {
        let bytes = encryption::open(&self.cipher, &self.key_version, blob)?;
        String::from_utf8(bytes)
            .map_err(|_| ConnectorError::DecryptionFailed("plaintext is not valid UTF-8".to_string()))
    }

    /// Serializes a value as JSON and encrypts it.
    pub fn encrypt_structured<T: Serialize>(&self, value: &T) -> Result<String> {
        let json = serde_json::to_string(value).map_err(|e| {
            ConnectorError::EncryptionFailed(format!("Failed to serialize credentials: {}", e))
        })?;
        self.encrypt(&json)
    }

    /// Decrypts a blob and deserializes the JSON inside it.
    pub fn decrypt_structured<T: DeserializeOwned>(&self, blob: &str) -> Result<T> {
        let json = self.decrypt(blob)?;
        serde_json::from_str(&json).map_err(|_| {
            ConnectorError::DecryptionFailed("decrypted credentials are not valid JSON".to_string())
        })
    }
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault")
            .field("key_version", &self.key_version)
            .finish_non_exhaustive()
    }
}
