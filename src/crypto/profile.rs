//! User profile: the local name and key pair, persisted as JSON.
//!
//! The relay layer only reads keys through the [`KeyStore`] accessors, so any
//! other profile storage can be plugged in.

use crate::crypto::{KeyPair, PrivateKey, PublicKey};
use crate::utils::{CryptoError, Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One integer of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyComponent {
    /// The shared modulus
    Modulus,
    /// `e` for public keys, `d` for private keys
    Exponent,
}

/// Key accessors the network manager needs from the profile store
pub trait KeyStore: Send + Sync {
    /// A component of the private key `(n, d)`
    fn get_private_key(&self, component: KeyComponent) -> Result<u64>;

    /// A component of the public key `(n, e)`
    fn get_public_key(&self, component: KeyComponent) -> Result<u64>;

    /// Assembled private key
    fn private_key(&self) -> Result<PrivateKey> {
        Ok(PrivateKey {
            n: self.get_private_key(KeyComponent::Modulus)?,
            d: self.get_private_key(KeyComponent::Exponent)?,
        })
    }

    /// Assembled public key
    fn public_key(&self) -> Result<PublicKey> {
        Ok(PublicKey {
            n: self.get_public_key(KeyComponent::Modulus)?,
            e: self.get_public_key(KeyComponent::Exponent)?,
        })
    }
}

/// Persisted user profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// Display and address book name
    pub username: String,
    /// Encryption keys
    pub keys: Option<KeyPair>,
    /// Creation timestamp
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl UserProfile {
    /// Create a profile with a freshly generated key pair
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            keys: Some(KeyPair::generate()),
            created_at: chrono::Utc::now(),
        }
    }

    /// Profile that communicates unencrypted
    pub fn without_keys(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            keys: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Read a profile from disk
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StorageError::MissingProfile {
                path: path.display().to_string(),
            }
            .into());
        }
        let json = std::fs::read_to_string(path).map_err(|e| StorageError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Write the profile to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            StorageError::Write {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Load the profile at `path`, creating one for `username` if absent
    pub fn load_or_create(path: &Path, username: &str) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        log::info!("No profile found, generating keys for '{}'", username);
        let profile = Self::new(username);
        profile.save(path)?;
        Ok(profile)
    }
}

impl KeyStore for UserProfile {
    fn get_private_key(&self, component: KeyComponent) -> Result<u64> {
        let keys = self.keys.ok_or(CryptoError::MissingPrivateKey)?;
        Ok(match component {
            KeyComponent::Modulus => keys.private.n,
            KeyComponent::Exponent => keys.private.d,
        })
    }

    fn get_public_key(&self, component: KeyComponent) -> Result<u64> {
        // A keyless profile publishes the plaintext sentinel
        let public = self.keys.map_or(PublicKey::PLAINTEXT, |k| k.public);
        Ok(match component {
            KeyComponent::Modulus => public.n,
            KeyComponent::Exponent => public.e,
        })
    }
}
