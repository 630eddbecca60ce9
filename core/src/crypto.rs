use crate::{Error, Result};
use aes_gcm::Aes256Gcm;
use argon2::Argon2;
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::aead::{Aead, KeyInit};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const KEY_CHECK_PLAINTEXT: &[u8] = b"revsnap key check";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionAlgorithm {
    #[default]
    #[serde(rename = "chacha20_poly1305")]
    ChaCha20Poly1305,
    Aes256Gcm,
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionAlgorithm::ChaCha20Poly1305 => write!(f, "ChaCha20-Poly1305"),
            EncryptionAlgorithm::Aes256Gcm => write!(f, "AES-256-GCM"),
        }
    }
}

/// Argon2id cost parameters used to stretch the configured key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Whether and how payloads are encrypted before they reach storage.
///
/// A policy that is enabled always carries a key: the constructors and
/// [`EncryptionPolicy::validate`] refuse anything else, so a misconfigured
/// medium fails before it touches storage.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub algorithm: EncryptionAlgorithm,
    #[serde(default, skip_serializing)]
    pub key: Option<String>,
}

impl fmt::Debug for EncryptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionPolicy")
            .field("enabled", &self.enabled)
            .field("algorithm", &self.algorithm)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl EncryptionPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(algorithm: EncryptionAlgorithm, key: impl Into<String>) -> Result<Self> {
        let policy = Self {
            enabled: true,
            algorithm,
            key: Some(key.into()),
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.key.as_deref().is_none_or(str::is_empty) {
            return Err(Error::Configuration(
                "Encryption is enabled but no key is configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the payload cipher, stretching the key with the medium salt.
    pub fn cipher(&self, salt: &[u8], params: &KdfParams) -> Result<Cipher> {
        self.validate()?;
        match self.key.as_deref() {
            Some(key) if self.enabled => {
                let key = derive_key(key, salt, params)?;
                Cipher::new(self.algorithm, &key)
            }
            _ => Ok(Cipher::Plain),
        }
    }
}

fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<[u8; KEY_LEN]> {
    let params = argon2::Params::new(params.memory, params.iterations, params.parallelism, Some(KEY_LEN))
        .map_err(|e| Error::Configuration(format!("Invalid key derivation parameters: {}", e)))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| Error::Encryption(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}

pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Symmetric payload transform. Sealed output is `nonce || ciphertext`.
pub enum Cipher {
    Plain,
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    Aes256Gcm(Box<Aes256Gcm>),
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cipher::Plain => "Plain",
            Cipher::ChaCha20Poly1305(_) => "ChaCha20Poly1305",
            Cipher::Aes256Gcm(_) => "Aes256Gcm",
        };
        f.write_str(name)
    }
}

impl Cipher {
    pub fn new(algorithm: EncryptionAlgorithm, key: &[u8]) -> Result<Self> {
        let invalid = || Error::Encryption(format!("Key must be {} bytes", KEY_LEN));
        Ok(match algorithm {
            EncryptionAlgorithm::ChaCha20Poly1305 => Cipher::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| invalid())?,
            )),
            EncryptionAlgorithm::Aes256Gcm => {
                Cipher::Aes256Gcm(Box::new(Aes256Gcm::new_from_slice(key).map_err(|_| invalid())?))
            }
        })
    }

    pub fn is_plain(&self) -> bool {
        matches!(self, Cipher::Plain)
    }

    /// Wraps a payload for writing.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        if !self.is_plain() {
            rand::thread_rng().fill_bytes(&mut nonce);
        }

        let ciphertext = match self {
            Cipher::Plain => return Ok(plaintext.to_vec()),
            Cipher::ChaCha20Poly1305(cipher) => {
                cipher.encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
            }
            Cipher::Aes256Gcm(cipher) => cipher.encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext),
        }
        .map_err(|e| Error::Encryption(format!("Encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Reverses [`Cipher::seal`]; a wrong key or tampered data fails authentication.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if self.is_plain() {
            return Ok(sealed.to_vec());
        }
        if sealed.len() < NONCE_LEN {
            return Err(Error::Encryption("Ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        match self {
            Cipher::Plain => Ok(sealed.to_vec()),
            Cipher::ChaCha20Poly1305(cipher) => {
                cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            }
            Cipher::Aes256Gcm(cipher) => cipher.decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext),
        }
        .map_err(|_| Error::Encryption("Decryption failed: wrong key or damaged payload".to_string()))
    }

    /// Token stored in the medium descriptor to detect a wrong key early.
    pub fn key_check(&self) -> Result<Option<String>> {
        if self.is_plain() {
            return Ok(None);
        }
        Ok(Some(hex::encode(self.seal(KEY_CHECK_PLAINTEXT)?)))
    }

    pub fn verify_key_check(&self, token: Option<&str>) -> Result<()> {
        match (self.is_plain(), token) {
            (true, None) => Ok(()),
            (true, Some(_)) => Err(Error::Encryption(
                "Medium is encrypted but no encryption key is configured".to_string(),
            )),
            (false, None) => Err(Error::Encryption(
                "Medium was created without encryption".to_string(),
            )),
            (false, Some(token)) => {
                let sealed = hex::decode(token)
                    .map_err(|e| Error::Corruption(format!("Invalid key check token: {}", e)))?;
                if self.open(&sealed)? != KEY_CHECK_PLAINTEXT {
                    return Err(Error::Encryption("Key check mismatch".to_string()));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            memory: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let salt = generate_salt();
        for algorithm in [EncryptionAlgorithm::ChaCha20Poly1305, EncryptionAlgorithm::Aes256Gcm] {
            let cipher = EncryptionPolicy::new(algorithm, "hunter2")
                .unwrap()
                .cipher(&salt, &fast_params())
                .unwrap();
            let sealed = cipher.seal(b"Hello, revsnap!").unwrap();
            assert_ne!(&sealed[NONCE_LEN..], b"Hello, revsnap!");
            assert_eq!(cipher.open(&sealed).unwrap(), b"Hello, revsnap!");
        }
    }

    #[test]
    fn test_disabled_is_passthrough() {
        let cipher = EncryptionPolicy::disabled().cipher(&[], &fast_params()).unwrap();
        assert!(cipher.is_plain());
        assert_eq!(cipher.seal(b"abc").unwrap(), b"abc");
        assert_eq!(cipher.key_check().unwrap(), None);
    }

    #[test]
    fn test_enabled_without_key_is_configuration_error() {
        assert!(matches!(
            EncryptionPolicy::new(EncryptionAlgorithm::Aes256Gcm, ""),
            Err(Error::Configuration(_))
        ));
        let policy = EncryptionPolicy {
            enabled: true,
            algorithm: EncryptionAlgorithm::ChaCha20Poly1305,
            key: None,
        };
        assert!(matches!(policy.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_wrong_key_fails_key_check() {
        let salt = generate_salt();
        let right = EncryptionPolicy::new(EncryptionAlgorithm::ChaCha20Poly1305, "right")
            .unwrap()
            .cipher(&salt, &fast_params())
            .unwrap();
        let wrong = EncryptionPolicy::new(EncryptionAlgorithm::ChaCha20Poly1305, "wrong")
            .unwrap()
            .cipher(&salt, &fast_params())
            .unwrap();

        let token = right.key_check().unwrap();
        right.verify_key_check(token.as_deref()).unwrap();
        let err = wrong.verify_key_check(token.as_deref()).unwrap_err();
        assert!(matches!(err, Error::Encryption(_)));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let cipher = Cipher::new(EncryptionAlgorithm::Aes256Gcm, &[7u8; KEY_LEN]).unwrap();
        let mut sealed = cipher.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(matches!(cipher.open(&sealed), Err(Error::Encryption(_))));
        assert!(matches!(cipher.open(&sealed[..4]), Err(Error::Encryption(_))));
    }

    #[test]
    fn test_policy_key_never_serialized() {
        let policy = EncryptionPolicy::new(EncryptionAlgorithm::ChaCha20Poly1305, "secret").unwrap();
        let json = serde_json::to_string(&policy).unwrap();
        assert!(!json.contains("secret"));
        assert!(!format!("{:?}", policy).contains("secret"));
    }
}
