use crate::config::MediumConfig;
use crate::crypto::{Cipher, EncryptionAlgorithm, KdfParams, generate_salt};
use crate::layout::MediumLayout;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DESCRIPTOR_FORMAT: u32 = 1;

/// Persistent identity and invariants of a medium, stored as `medium.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediumDescriptor {
    pub format: u32,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub layout: MediumLayout,
    pub block_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionAlgorithm>,
    pub kdf: KdfParams,
    /// Hex encoded Argon2 salt.
    pub salt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_check: Option<String>,
}

impl MediumDescriptor {
    pub fn new(config: &MediumConfig) -> Self {
        Self {
            format: DESCRIPTOR_FORMAT,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            layout: config.layout,
            block_size: config.block_size,
            encryption: config.encryption.enabled.then_some(config.encryption.algorithm),
            kdf: config.kdf,
            salt: hex::encode(generate_salt()),
            key_check: None,
        }
    }

    pub fn salt(&self) -> Result<Vec<u8>> {
        hex::decode(&self.salt).map_err(|e| Error::Corruption(format!("Invalid medium salt: {}", e)))
    }

    /// Rejects a configuration that contradicts what is already on storage.
    pub fn check_compatible(&self, config: &MediumConfig) -> Result<()> {
        if self.format != DESCRIPTOR_FORMAT {
            return Err(Error::Configuration(format!(
                "Unsupported medium format version {}",
                self.format
            )));
        }
        if self.layout != config.layout {
            return Err(Error::Configuration(format!(
                "Medium uses the {} layout but {} is configured",
                self.layout, config.layout
            )));
        }
        if self.block_size != config.block_size {
            return Err(Error::Configuration(format!(
                "Medium uses {} byte blocks but {} is configured",
                self.block_size, config.block_size
            )));
        }
        match (self.encryption, config.encryption.enabled) {
            (Some(stored), true) if stored != config.encryption.algorithm => Err(Error::Configuration(format!(
                "Medium is encrypted with {} but {} is configured",
                stored, config.encryption.algorithm
            ))),
            _ => Ok(()),
        }
    }

    /// Builds the medium cipher and checks it against the stored key token.
    pub fn open_cipher(&self, config: &MediumConfig) -> Result<Cipher> {
        let cipher = config.encryption.cipher(&self.salt()?, &self.kdf)?;
        cipher.verify_key_check(self.key_check.as_deref())?;
        Ok(cipher)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Corruption(format!("Invalid medium descriptor: {}", e)))
    }
}
