//! Encryption of secrets at rest.
//!
//! API keys are AES-256-GCM encrypted before they are written to the vector
//! database or a local config file. The process-wide key lives in the
//! `ARBOR_SECRET_KEY` env slot; if absent it is generated once and appended
//! to the process env file so restarts can decrypt what earlier runs saved.
//!
//! Wire format per value: `base64(nonce || ciphertext)` with a random
//! 12-byte nonce.

use std::io::Write;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Error, Result};

/// Env slot holding the base64-encoded 32-byte process key.
pub const SECRET_KEY_ENV: &str = "ARBOR_SECRET_KEY";

/// Env slot overriding which file the generated key is appended to.
pub const ENV_FILE_ENV: &str = "ARBOR_ENV_FILE";

const NONCE_LEN: usize = 12;

/// Handle to the process-wide symmetric key.
#[derive(Clone)]
pub struct SecretBox {
    key: Key<Aes256Gcm>,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(..)")
    }
}

impl SecretBox {
    /// Load the key from `ARBOR_SECRET_KEY`, generating and persisting one
    /// if the slot is empty. Failure here is process-fatal: without a stable
    /// key nothing already persisted can ever be decrypted.
    pub fn bootstrap() -> Result<Self> {
        if let Ok(encoded) = std::env::var(SECRET_KEY_ENV) {
            if !encoded.is_empty() {
                return Self::from_encoded(&encoded);
            }
        }

        let key = Aes256Gcm::generate_key(OsRng);
        let encoded = BASE64.encode(key);
        persist_key(&encoded)?;
        std::env::set_var(SECRET_KEY_ENV, &encoded);
        tracing::info!(env_file = %env_file_path().display(), "generated new secret key");
        Ok(Self { key })
    }

    /// Build from an already-encoded key (tests, explicit injection).
    pub fn from_encoded(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("{SECRET_KEY_ENV}: invalid base64: {e}")))?;
        if raw.len() != 32 {
            return Err(Error::Config(format!(
                "{SECRET_KEY_ENV}: expected 32 bytes, got {}",
                raw.len()
            )));
        }
        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(&raw),
        })
    }

    /// Generate an ephemeral key (tests only; nothing encrypted with it
    /// survives the process).
    pub fn ephemeral() -> Self {
        Self {
            key: Aes256Gcm::generate_key(OsRng),
        }
    }

    /// Encrypt one secret value.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| Error::Config("secret encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decrypt one secret value.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("secret payload: invalid base64: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(Error::Config("secret payload too short".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Config("secret decryption failed (wrong key?)".into()))?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::Config("decrypted secret is not UTF-8".into()))
    }
}

fn env_file_path() -> PathBuf {
    std::env::var(ENV_FILE_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".env"))
}

/// Append `ARBOR_SECRET_KEY=<key>` to the env file, creating it if needed.
fn persist_key(encoded: &str) -> Result<()> {
    let path = env_file_path();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    writeln!(file, "{SECRET_KEY_ENV}={encoded}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let secrets = SecretBox::ephemeral();
        let encoded = secrets.encrypt("sk-very-secret").unwrap();
        assert_ne!(encoded, "sk-very-secret");
        assert_eq!(secrets.decrypt(&encoded).unwrap(), "sk-very-secret");
    }

    #[test]
    fn each_encryption_uses_a_fresh_nonce() {
        let secrets = SecretBox::ephemeral();
        let a = secrets.encrypt("same").unwrap();
        let b = secrets.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(secrets.decrypt(&a).unwrap(), secrets.decrypt(&b).unwrap());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let a = SecretBox::ephemeral();
        let b = SecretBox::ephemeral();
        let encoded = a.encrypt("secret").unwrap();
        assert!(b.decrypt(&encoded).is_err());
    }

    #[test]
    fn from_encoded_rejects_bad_lengths() {
        assert!(SecretBox::from_encoded("short").is_err());
        let sixteen = BASE64.encode([0u8; 16]);
        assert!(SecretBox::from_encoded(&sixteen).is_err());
    }

    #[test]
    fn persisted_key_round_trips_through_encoding() {
        let secrets = SecretBox::ephemeral();
        let encoded_key = BASE64.encode(secrets.key);
        let restored = SecretBox::from_encoded(&encoded_key).unwrap();
        let payload = secrets.encrypt("carried over").unwrap();
        assert_eq!(restored.decrypt(&payload).unwrap(), "carried over");
    }
}
