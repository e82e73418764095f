use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use keyring::Error as KeyringError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::CredentialStorage;
use crate::crypto::{decrypt_blob, derive_key, encrypt_blob, load_or_create_master_key, KeyPurpose, KEYRING_SERVICE};
use crate::error::CoreError;
use crate::session_store::write_atomically;

pub const USERNAME_ENV: &str = "IG_USERNAME";
pub const PASSWORD_ENV: &str = "IG_PASSWORD";
const LAST_USERNAME_ACCOUNT: &str = "last_username";

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

pub trait CredentialStore {
    /// Missing or unreadable credentials are `None`; backends log why.
    fn load(&self) -> Option<Credentials>;
    fn save(&self, username: &str, password: &str) -> Result<(), CoreError>;
    fn delete(&self, username: Option<&str>) -> Result<(), CoreError>;
}

/// System keychain. The password is stored under the username, plus a
/// `last_username` pointer so it can be found again without asking.
#[derive(Debug, Default)]
pub struct KeyringStore;

fn keyring_entry(account: &str) -> Result<keyring::Entry, CoreError> {
    keyring::Entry::new(KEYRING_SERVICE, account)
        .map_err(|e| CoreError::Credential(format!("keychain init failed: {e}")))
}

impl CredentialStore for KeyringStore {
    fn load(&self) -> Option<Credentials> {
        let read = |account: &str| -> Option<String> {
            match keyring_entry(account).ok()?.get_password() {
                Ok(value) => Some(value),
                Err(KeyringError::NoEntry) => None,
                Err(err) => {
                    warn!(error = %err, "failed to read from keychain");
                    None
                }
            }
        };
        let username = read(LAST_USERNAME_ACCOUNT)?;
        let password = read(&username)?;
        info!(%username, "loaded credentials from keychain");
        Some(Credentials::new(username, password))
    }

    fn save(&self, username: &str, password: &str) -> Result<(), CoreError> {
        keyring_entry(username)?
            .set_password(password)
            .map_err(|e| CoreError::Credential(format!("failed to save to keychain: {e}")))?;
        keyring_entry(LAST_USERNAME_ACCOUNT)?
            .set_password(username)
            .map_err(|e| CoreError::Credential(format!("failed to save to keychain: {e}")))?;
        info!(%username, "credentials saved to keychain");
        Ok(())
    }

    fn delete(&self, username: Option<&str>) -> Result<(), CoreError> {
        let username = username
            .ok_or_else(|| CoreError::Credential("username required to delete keychain credentials".to_string()))?;
        match keyring_entry(username)?.delete_password() {
            Ok(()) | Err(KeyringError::NoEntry) => {}
            Err(err) => return Err(CoreError::Credential(format!("failed to delete from keychain: {err}"))),
        }
        let pointer = keyring_entry(LAST_USERNAME_ACCOUNT)?;
        if matches!(pointer.get_password(), Ok(last) if last == username) {
            if let Err(err) = pointer.delete_password() {
                warn!(error = %err, "could not clear last username from keychain");
            }
        }
        info!(%username, "credentials deleted from keychain");
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    username: String,
    password: String,
}

/// AES-GCM sealed JSON document on disk.
#[derive(Debug, Clone)]
pub struct EncryptedFileStore {
    path: PathBuf,
}

impl EncryptedFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<Option<Credentials>, CoreError> {
        let sealed = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let key = derive_key(&load_or_create_master_key()?, KeyPurpose::Credentials)?;
        let plain = decrypt_blob(&sealed, &key)?;
        let stored: StoredCredentials = serde_json::from_slice(&plain)?;
        let StoredCredentials { username, password } = stored;
        Ok(Some(Credentials {
            username,
            password: Zeroizing::new(password),
        }))
    }
}

impl CredentialStore for EncryptedFileStore {
    fn load(&self) -> Option<Credentials> {
        match self.read() {
            Ok(Some(creds)) => {
                info!(path = %self.path.display(), "loaded credentials from file");
                Some(creds)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to load credentials file");
                None
            }
        }
    }

    fn save(&self, username: &str, password: &str) -> Result<(), CoreError> {
        let doc = Zeroizing::new(serde_json::to_vec(&StoredCredentials {
            username: username.to_string(),
            password: password.to_string(),
        })?);
        let key = derive_key(&load_or_create_master_key()?, KeyPurpose::Credentials)?;
        let sealed = encrypt_blob(&doc, &key)?;
        write_atomically(&self.path, &sealed)?;
        info!(path = %self.path.display(), "encrypted credentials saved");
        Ok(())
    }

    fn delete(&self, _username: Option<&str>) -> Result<(), CoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "deleted credentials file");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Reads `IG_USERNAME` / `IG_PASSWORD`; never writes.
#[derive(Debug, Default)]
pub struct EnvStore;

impl CredentialStore for EnvStore {
    fn load(&self) -> Option<Credentials> {
        let username = std::env::var(USERNAME_ENV).ok().filter(|v| !v.is_empty())?;
        let password = Zeroizing::new(std::env::var(PASSWORD_ENV).ok().filter(|v| !v.is_empty())?);
        Some(Credentials { username, password })
    }

    fn save(&self, _username: &str, _password: &str) -> Result<(), CoreError> {
        info!("set {USERNAME_ENV} and {PASSWORD_ENV} to reuse these credentials");
        Ok(())
    }

    fn delete(&self, _username: Option<&str>) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoStore;

impl CredentialStore for NoStore {
    fn load(&self) -> Option<Credentials> {
        None
    }

    fn save(&self, _username: &str, _password: &str) -> Result<(), CoreError> {
        debug!("credential storage disabled, not saving");
        Ok(())
    }

    fn delete(&self, _username: Option<&str>) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Front door for credential persistence. Environment variables always win on load.
pub struct CredentialManager {
    storage: CredentialStorage,
    backend: Box<dyn CredentialStore + Send + Sync>,
}

impl CredentialManager {
    pub fn new(storage: CredentialStorage, credentials_file: impl Into<PathBuf>) -> Self {
        let backend: Box<dyn CredentialStore + Send + Sync> = match storage {
            CredentialStorage::Keyring => Box::new(KeyringStore),
            CredentialStorage::File => Box::new(EncryptedFileStore::new(credentials_file)),
            CredentialStorage::Env => Box::new(EnvStore),
            CredentialStorage::None => Box::new(NoStore),
        };
        Self { storage, backend }
    }

    pub fn with_backend(storage: CredentialStorage, backend: Box<dyn CredentialStore + Send + Sync>) -> Self {
        Self { storage, backend }
    }

    pub fn storage(&self) -> CredentialStorage {
        self.storage
    }

    pub fn load(&self) -> Option<Credentials> {
        if let Some(creds) = EnvStore.load() {
            info!("loaded credentials from environment variables");
            return Some(creds);
        }
        self.backend.load()
    }

    pub fn save(&self, username: &str, password: &str) -> Result<(), CoreError> {
        self.backend.save(username, password)
    }

    pub fn delete(&self, username: Option<&str>) -> Result<(), CoreError> {
        self.backend.delete(username)
    }
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager").field("storage", &self.storage).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_password() {
        let creds = Credentials::new("alice", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn no_store_accepts_and_forgets() {
        let store = NoStore;
        store.save("a", "b").expect("save");
        assert!(store.load().is_none());
        store.delete(Some("a")).expect("delete");
    }
}
