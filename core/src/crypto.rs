use std::sync::OnceLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use keyring::Error as KeyringError;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CoreError;

pub const KEYRING_SERVICE: &str = "instagram_dm_fetcher";
const KEYRING_ACCOUNT: &str = "encryption_key";
const MASTER_KEY_ENV: &str = "INSTADM_MASTER_KEY_HEX";

const MAGIC: [u8; 4] = *b"IDMC";
const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + 1 + NONCE_LEN;

pub struct MasterKey(Zeroizing<[u8; 32]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MasterKey(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Purpose-specific derived key for domain separation.
pub struct DerivedKey(Zeroizing<[u8; 32]>);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// Encrypted credentials file
    Credentials,
}

impl KeyPurpose {
    fn info(&self) -> &'static [u8] {
        match self {
            KeyPurpose::Credentials => b"instadm-credentials-v1",
        }
    }
}

/// HKDF-SHA256 expansion of the master key, bound to `purpose` through the info string.
pub fn derive_key(master: &MasterKey, purpose: KeyPurpose) -> Result<DerivedKey, CoreError> {
    let mut okm = Zeroizing::new([0u8; 32]);
    Hkdf::<Sha256>::new(None, master.as_bytes())
        .expand(purpose.info(), &mut okm[..])
        .map_err(|_| CoreError::Crypto("could not derive credentials key".to_string()))?;
    Ok(DerivedKey(okm))
}

static MASTER_KEY_CACHE: OnceLock<[u8; 32]> = OnceLock::new();

fn remember(bytes: [u8; 32]) -> MasterKey {
    // First writer wins; later loads in the same process see the same key.
    let bytes = *MASTER_KEY_CACHE.get_or_init(|| bytes);
    MasterKey::from_bytes(bytes)
}

/// Pins the master key to a hash of `passphrase` so tests never touch the OS keychain.
#[cfg(any(test, debug_assertions))]
pub fn set_test_key_from_passphrase(passphrase: &str) {
    let bytes: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
    remember(bytes);
    std::env::set_var(MASTER_KEY_ENV, hex::encode(bytes));
}

/// Master key for the credentials file, generated and stored in the keychain on first use.
pub fn load_or_create_master_key() -> Result<MasterKey, CoreError> {
    if let Some(bytes) = MASTER_KEY_CACHE.get() {
        return Ok(MasterKey::from_bytes(*bytes));
    }
    // Release builds only ever read the key from the keychain.
    #[cfg(any(debug_assertions, test))]
    if let Ok(hex) = std::env::var(MASTER_KEY_ENV) {
        return Ok(remember(parse_hex_key(&hex)?));
    }

    let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_ACCOUNT)
        .map_err(|e| CoreError::Crypto(format!("keychain unavailable: {e}")))?;
    match entry.get_password() {
        Ok(stored) => Ok(remember(parse_hex_key(&stored)?)),
        Err(KeyringError::NoEntry) => {
            let mut fresh = [0u8; 32];
            OsRng.fill_bytes(&mut fresh);
            entry
                .set_password(&hex::encode(fresh))
                .map_err(|e| CoreError::Crypto(format!("could not store encryption key: {e}")))?;
            Ok(remember(fresh))
        }
        Err(err) => Err(CoreError::Crypto(format!("could not read encryption key: {err}"))),
    }
}

fn parse_hex_key(hex: &str) -> Result<[u8; 32], CoreError> {
    let decoded = hex::decode(hex.trim()).map_err(|e| CoreError::Crypto(format!("encryption key is not hex: {e}")))?;
    <[u8; 32]>::try_from(decoded.as_slice())
        .map_err(|_| CoreError::Crypto(format!("encryption key must be 32 bytes, got {}", decoded.len())))
}

/// Seals `plaintext` as `MAGIC | VERSION | nonce | ciphertext+tag`.
pub fn encrypt_blob(plaintext: &[u8], key: &DerivedKey) -> Result<Vec<u8>, CoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CoreError::Crypto(format!("encrypt failed: {e}")))?;
    let mut out = Vec::with_capacity(HEADER_LEN + ct.len());
    out.extend_from_slice(&MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

pub fn decrypt_blob(blob: &[u8], key: &DerivedKey) -> Result<Zeroizing<Vec<u8>>, CoreError> {
    if blob.len() < HEADER_LEN {
        return Err(CoreError::Crypto("encrypted blob too small".to_string()));
    }
    if blob[..MAGIC.len()] != MAGIC {
        return Err(CoreError::Crypto("invalid blob header".to_string()));
    }
    if blob[MAGIC.len()] != VERSION {
        return Err(CoreError::Crypto("unsupported blob version".to_string()));
    }
    let nonce = &blob[MAGIC.len() + 1..HEADER_LEN];
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let pt = cipher
        .decrypt(Nonce::from_slice(nonce), &blob[HEADER_LEN..])
        .map_err(|e| CoreError::Crypto(format!("decrypt failed: {e}")))?;
    Ok(Zeroizing::new(pt))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master() -> MasterKey {
        set_test_key_from_passphrase("instadm-tests");
        load_or_create_master_key().expect("key")
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = derive_key(&test_master(), KeyPurpose::Credentials).expect("derive");
        let sealed = encrypt_blob(b"hello world", &key).expect("encrypt");
        assert_eq!(&sealed[..4], b"IDMC");
        let opened = decrypt_blob(&sealed, &key).expect("decrypt");
        assert_eq!(opened.as_slice(), b"hello world");
    }

    #[test]
    fn decrypt_rejects_tampering_and_wrong_key() {
        let creds = derive_key(&test_master(), KeyPurpose::Credentials).expect("derive");
        let other = derive_key(&MasterKey::from_bytes([7u8; 32]), KeyPurpose::Credentials).expect("derive");
        let mut sealed = encrypt_blob(b"secret", &creds).expect("encrypt");
        assert!(decrypt_blob(&sealed, &other).is_err());
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(decrypt_blob(&sealed, &creds).is_err());
        assert!(decrypt_blob(b"IDM", &creds).is_err());
    }

    #[test]
    fn derive_key_is_deterministic() {
        let master = test_master();
        let a = derive_key(&master, KeyPurpose::Credentials).expect("a");
        let b = derive_key(&master, KeyPurpose::Credentials).expect("b");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), master.as_bytes());

        assert!(parse_hex_key("abcd").is_err());
        assert!(parse_hex_key(&hex::encode([1u8; 32])).is_ok());
    }
}
