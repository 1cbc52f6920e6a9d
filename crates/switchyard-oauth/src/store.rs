use std::path::{Path, PathBuf};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use aes_gcm::aead::rand_core::RngCore;
use sha2::Digest;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload could not be decrypted")]
    Decrypt,
    #[error("payload is malformed")]
    Malformed,
}

/// Where the serialized token set lives. One payload, replaced atomically on
/// every save.
pub trait SecretStore: Send + Sync {
    fn load(&self) -> Result<Option<String>, StoreError>;
    fn save(&self, payload: &str) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// OS credential store backend.
pub struct KeyringStore {
    service: String,
    user: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            user: user.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service, &self.user)
            .map_err(|err| StoreError::Keyring(err.to_string()))
    }
}

impl SecretStore for KeyringStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        match self.entry()?.get_password() {
            Ok(payload) => Ok(Some(payload)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(StoreError::Keyring(err.to_string())),
        }
    }

    fn save(&self, payload: &str) -> Result<(), StoreError> {
        self.entry()?
            .set_password(payload)
            .map_err(|err| StoreError::Keyring(err.to_string()))
    }

    fn clear(&self) -> Result<(), StoreError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(StoreError::Keyring(err.to_string())),
        }
    }
}

const NONCE_LEN: usize = 12;

/// AES-256-GCM encrypted file backend. The key is derived from caller-provided
/// key material; the nonce is generated per save and prepended to the
/// ciphertext.
pub struct EncryptedFileStore {
    path: PathBuf,
    key: [u8; 32],
}

impl EncryptedFileStore {
    pub fn new(path: impl AsRef<Path>, key_material: &str) -> Self {
        let mut hasher = sha2::Sha256::new();
        hasher.update(key_material.as_bytes());
        Self {
            path: path.as_ref().to_path_buf(),
            key: hasher.finalize().into(),
        }
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new((&self.key).into())
    }
}

impl SecretStore for EncryptedFileStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if raw.len() < NONCE_LEN {
            return Err(StoreError::Malformed);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Decrypt)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| StoreError::Malformed)
    }

    fn save(&self, payload: &str) -> Result<(), StoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), payload.as_bytes())
            .map_err(|_| StoreError::Decrypt)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&ciphertext);
        let staged = self.path.with_extension("tmp");
        std::fs::write(&staged, &raw)?;
        std::fs::rename(&staged, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemoryStore {
    payload: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemoryStore {
    fn load(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .payload
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn save(&self, payload: &str) -> Result<(), StoreError> {
        *self
            .payload
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(payload.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        *self
            .payload
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypted_file_round_trips() {
        let dir = std::env::temp_dir().join("switchyard-oauth-store-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.bin");
        let store = EncryptedFileStore::new(&path, "correct horse battery");
        store.save("{\"tokens\":[]}").unwrap();
        assert_eq!(store.load().unwrap().as_deref(), Some("{\"tokens\":[]}"));

        // A different key must not decrypt the payload.
        let wrong = EncryptedFileStore::new(&path, "wrong key");
        assert!(matches!(wrong.load(), Err(StoreError::Decrypt)));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
