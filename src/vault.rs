// =============================================================================
// Credential Vault — AES-256-GCM encrypted at-rest store for broker secrets
// =============================================================================
//
// One ciphertext file per broker under `<data_dir>/credentials/<broker>.enc`.
// The encryption key is derived from the operator-supplied master key via
// PBKDF2-HMAC-SHA256 with a per-install random salt persisted next to the
// ciphertexts. File layout: 12-byte nonce || GCM ciphertext.
//
// Plaintext credentials never touch disk. Log lines mention only broker
// names and presence booleans. Writes are atomic (tmp + rename) and the
// whole store is guarded by a process-wide mutex.
// =============================================================================

use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::Sha256;
use tracing::{info, warn};

use crate::types::Credential;

/// PBKDF2 iteration count for key derivation.
const PBKDF2_ROUNDS: u32 = 100_000;
/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// Salt length in bytes.
const SALT_LEN: usize = 16;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("no stored credential for broker '{0}'")]
    NotFound(String),

    /// Wrong master key, truncated file, or tampered ciphertext. Never
    /// silently ignored.
    #[error("failed to decrypt credential for broker '{0}'")]
    DecryptFailed(String),

    #[error("vault io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

// =============================================================================
// CredentialVault
// =============================================================================

pub struct CredentialVault {
    dir: PathBuf,
    cipher: Aes256Gcm,
    /// Serialises all file operations; writes are tmp + rename underneath.
    lock: Mutex<()>,
}

impl CredentialVault {
    /// Open (or initialise) the vault under `<data_dir>/credentials`.
    ///
    /// The first open creates a random salt file; subsequent opens re-derive
    /// the same key from `master_key` + salt.
    pub fn open(data_dir: &Path, master_key: &str) -> Result<Self, VaultError> {
        let dir = data_dir.join("credentials");
        std::fs::create_dir_all(&dir)?;

        let salt_path = dir.join(".salt");
        let salt = if salt_path.exists() {
            let salt = std::fs::read(&salt_path)?;
            if salt.len() != SALT_LEN {
                warn!("vault salt file has unexpected length, regenerating");
                Self::write_new_salt(&salt_path)?
            } else {
                salt
            }
        } else {
            Self::write_new_salt(&salt_path)?
        };

        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(master_key.as_bytes(), &salt, PBKDF2_ROUNDS, &mut key);

        let cipher = Aes256Gcm::new_from_slice(&key)
            .expect("derived key is always 32 bytes");

        info!(dir = %dir.display(), "credential vault opened");
        Ok(Self {
            dir,
            cipher,
            lock: Mutex::new(()),
        })
    }

    fn write_new_salt(path: &Path) -> Result<Vec<u8>, VaultError> {
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        std::fs::write(path, &salt)?;
        Ok(salt)
    }

    fn path_for(&self, broker: &str) -> PathBuf {
        self.dir.join(format!("{broker}.enc"))
    }

    /// Broker names become file names; restrict to a safe character set.
    pub fn is_valid_broker_name(broker: &str) -> bool {
        !broker.is_empty()
            && broker.len() <= 32
            && broker
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Encrypt and atomically persist `credential` for `broker`.
    pub fn save(&self, broker: &str, credential: &Credential) -> Result<(), VaultError> {
        let _guard = self.lock.lock();

        let plaintext = serde_json::to_vec(credential)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| VaultError::DecryptFailed(broker.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        let path = self.path_for(broker);
        let tmp_path = path.with_extension("enc.tmp");
        std::fs::write(&tmp_path, &blob)?;
        std::fs::rename(&tmp_path, &path)?;

        info!(broker = %broker, "credential saved to vault");
        Ok(())
    }

    /// Load and decrypt the credential for `broker`.
    pub fn load(&self, broker: &str) -> Result<Credential, VaultError> {
        let _guard = self.lock.lock();

        let path = self.path_for(broker);
        if !path.exists() {
            return Err(VaultError::NotFound(broker.to_string()));
        }

        let blob = std::fs::read(&path)?;
        if blob.len() <= NONCE_LEN {
            return Err(VaultError::DecryptFailed(broker.to_string()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| VaultError::DecryptFailed(broker.to_string()))?;

        let credential: Credential = serde_json::from_slice(&plaintext)
            .map_err(|_| VaultError::DecryptFailed(broker.to_string()))?;

        Ok(credential)
    }

    /// Delete the stored credential. Returns whether anything was removed.
    pub fn delete(&self, broker: &str) -> Result<bool, VaultError> {
        let _guard = self.lock.lock();

        let path = self.path_for(broker);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        info!(broker = %broker, "credential deleted from vault");
        Ok(true)
    }

    /// Brokers with a stored credential, sorted.
    pub fn list(&self) -> Result<Vec<String>, VaultError> {
        let _guard = self.lock.lock();

        let mut brokers = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("enc") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    brokers.push(stem.to_string());
                }
            }
        }
        brokers.sort();
        Ok(brokers)
    }

    /// Presence check without decrypting.
    pub fn contains(&self, broker: &str) -> bool {
        self.path_for(broker).exists()
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("dir", &self.dir)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_credential() -> Credential {
        Credential {
            api_key: "test_api_key".into(),
            api_secret: "test_api_secret".into(),
            access_token: Some("test_access_token".into()),
            access_token_expiry: None,
            refresh_token: None,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = CredentialVault::open(tmp.path(), "master-secret").unwrap();

        vault.save("zerodha", &sample_credential()).unwrap();
        let loaded = vault.load("zerodha").unwrap();
        assert_eq!(loaded.api_key, "test_api_key");
        assert_eq!(loaded.api_secret, "test_api_secret");
        assert_eq!(loaded.access_token.as_deref(), Some("test_access_token"));
    }

    #[test]
    fn ciphertext_contains_no_plaintext() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = CredentialVault::open(tmp.path(), "master-secret").unwrap();
        vault.save("zerodha", &sample_credential()).unwrap();

        let blob = std::fs::read(tmp.path().join("credentials/zerodha.enc")).unwrap();
        let haystack = String::from_utf8_lossy(&blob);
        assert!(!haystack.contains("test_api_key"));
        assert!(!haystack.contains("test_api_secret"));
        assert!(!haystack.contains("test_access_token"));
    }

    #[test]
    fn load_missing_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = CredentialVault::open(tmp.path(), "master-secret").unwrap();
        match vault.load("nope") {
            Err(VaultError::NotFound(b)) => assert_eq!(b, "nope"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn wrong_master_key_is_decrypt_failed() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let vault = CredentialVault::open(tmp.path(), "right-key").unwrap();
            vault.save("zerodha", &sample_credential()).unwrap();
        }
        let vault = CredentialVault::open(tmp.path(), "wrong-key").unwrap();
        match vault.load("zerodha") {
            Err(VaultError::DecryptFailed(_)) => {}
            other => panic!("expected DecryptFailed, got {other:?}"),
        }
    }

    #[test]
    fn corrupt_ciphertext_is_decrypt_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = CredentialVault::open(tmp.path(), "master-secret").unwrap();
        vault.save("zerodha", &sample_credential()).unwrap();

        let path = tmp.path().join("credentials/zerodha.enc");
        let mut blob = std::fs::read(&path).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        std::fs::write(&path, &blob).unwrap();

        match vault.load("zerodha") {
            Err(VaultError::DecryptFailed(_)) => {}
            other => panic!("expected DecryptFailed, got {other:?}"),
        }
    }

    #[test]
    fn same_key_reopens_existing_vault() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let vault = CredentialVault::open(tmp.path(), "master-secret").unwrap();
            vault.save("zerodha", &sample_credential()).unwrap();
        }
        // A fresh handle with the same master key reads the same salt and
        // decrypts existing files.
        let vault = CredentialVault::open(tmp.path(), "master-secret").unwrap();
        assert!(vault.load("zerodha").is_ok());
    }

    #[test]
    fn list_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = CredentialVault::open(tmp.path(), "master-secret").unwrap();

        vault.save("zerodha", &sample_credential()).unwrap();
        vault.save("paper", &sample_credential()).unwrap();
        assert_eq!(vault.list().unwrap(), vec!["paper", "zerodha"]);
        assert!(vault.contains("paper"));

        assert!(vault.delete("paper").unwrap());
        assert!(!vault.delete("paper").unwrap());
        assert_eq!(vault.list().unwrap(), vec!["zerodha"]);
    }

    #[test]
    fn broker_name_validation() {
        assert!(CredentialVault::is_valid_broker_name("zerodha"));
        assert!(!CredentialVault::is_valid_broker_name("Zerodha"));
        assert!(!CredentialVault::is_valid_broker_name("../etc"));
        assert!(!CredentialVault::is_valid_broker_name(""));
    }
}
