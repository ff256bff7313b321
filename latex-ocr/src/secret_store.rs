//! At-rest storage for the inference API key.
//!
//! Settings never hold the key in clear text when the platform offers a
//! credential store: they hold an opaque blob that only the store can turn
//! back into the key. Without that capability the key is kept as plain text.

use keyring::Entry;
use log::{debug, error, warn};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

const SERVICE: &str = "latex-ocr.inference-api";
/// Value written and read back by [`verify_round_trip`]
const CHECK_VALUE: &str = "latex-ocr capability check";

#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    #[error("Platform credential store unavailable")]
    Unavailable,
    #[error("Sealed key is not valid UTF-8")]
    InvalidBlob,
    #[error("Credential store returned a different value than it was given")]
    Mismatch,
    #[error("Credential store error: {0}")]
    Keyring(#[from] keyring::Error),
}

/// Capability-checked secret store.
pub trait SecretStore: Send + Sync {
    /// Whether `encrypt`/`decrypt` can be used on this platform.
    fn is_available(&self) -> bool;

    /// Turn a plain key into an opaque blob safe to persist.
    fn encrypt(&self, plain: &str) -> Result<Vec<u8>, SecretStoreError>;

    /// Recover the key from a blob produced by `encrypt`.
    fn decrypt(&self, opaque: &[u8]) -> Result<String, SecretStoreError>;

    /// Drop whatever the store keeps for a blob produced by `encrypt`.
    fn forget(&self, opaque: &[u8]) -> Result<(), SecretStoreError>;
}

/// Seal a throwaway value, read it back and forget it.
///
/// Creating an entry proves nothing about persistence; only a full round
/// trip does.
pub fn verify_round_trip(store: &dyn SecretStore) -> Result<(), SecretStoreError> {
    let blob = store.encrypt(CHECK_VALUE)?;
    let read = store.decrypt(&blob);
    store.forget(&blob)?;
    if read? != CHECK_VALUE {
        return Err(SecretStoreError::Mismatch);
    }
    Ok(())
}

/// OS credential store (macOS Keychain, Secret Service, Windows Credential Manager).
///
/// The opaque blob is the account name under which the key was saved.
pub struct KeyringStore;

impl SecretStore for KeyringStore {
    fn is_available(&self) -> bool {
        match verify_round_trip(self) {
            Ok(()) => true,
            Err(e) => {
                warn!("[Keychain] Credential store unavailable: {}", e);
                false
            }
        }
    }

    fn encrypt(&self, plain: &str) -> Result<Vec<u8>, SecretStoreError> {
        let account = uuid::Uuid::new_v4().to_string();
        let entry = Entry::new(SERVICE, &account)?;

        match entry.set_password(plain) {
            Ok(()) => {
                debug!("[Keychain] Saved entry (account '{}')", account);
                Ok(account.into_bytes())
            }
            Err(e) => {
                error!("[Keychain] Failed to save entry: {:?}", e);
                Err(e.into())
            }
        }
    }

    fn decrypt(&self, opaque: &[u8]) -> Result<String, SecretStoreError> {
        let account = std::str::from_utf8(opaque).map_err(|_| SecretStoreError::InvalidBlob)?;
        debug!("[Keychain] Loading API key (account '{}')", account);

        let entry = Entry::new(SERVICE, account)?;
        match entry.get_password() {
            Ok(password) => Ok(password),
            Err(e) => {
                error!("[Keychain] Error loading API key: {:?}", e);
                Err(e.into())
            }
        }
    }

    fn forget(&self, opaque: &[u8]) -> Result<(), SecretStoreError> {
        let account = std::str::from_utf8(opaque).map_err(|_| SecretStoreError::InvalidBlob)?;
        let entry = Entry::new(SERVICE, account)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {
                debug!("[Keychain] Deleted entry (account '{}')", account);
                Ok(())
            }
            Err(e) => {
                warn!("[Keychain] Failed to delete entry: {:?}", e);
                Err(e.into())
            }
        }
    }
}

/// Fallback used when no platform store exists. Not encryption.
pub struct PlaintextStore;

impl SecretStore for PlaintextStore {
    fn is_available(&self) -> bool {
        false
    }

    fn encrypt(&self, _plain: &str) -> Result<Vec<u8>, SecretStoreError> {
        Err(SecretStoreError::Unavailable)
    }

    fn decrypt(&self, _opaque: &[u8]) -> Result<String, SecretStoreError> {
        Err(SecretStoreError::Unavailable)
    }

    fn forget(&self, _opaque: &[u8]) -> Result<(), SecretStoreError> {
        Ok(())
    }
}

/// API key as persisted in the settings file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ApiKeyMaterial {
    Plain(String),
    Sealed(Vec<u8>),
}

impl Default for ApiKeyMaterial {
    fn default() -> Self {
        ApiKeyMaterial::Plain(String::new())
    }
}

impl std::fmt::Debug for ApiKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiKeyMaterial::Plain(key) if key.is_empty() => f.write_str("Plain(\"\")"),
            ApiKeyMaterial::Plain(_) => f.write_str("Plain([REDACTED])"),
            ApiKeyMaterial::Sealed(_) => f.write_str("Sealed([REDACTED])"),
        }
    }
}

/// Seal `plain` with the store when it is available, keep it as plain text otherwise.
pub fn seal_api_key(plain: &str, store: &dyn SecretStore) -> ApiKeyMaterial {
    if plain.is_empty() || !store.is_available() {
        return ApiKeyMaterial::Plain(plain.to_string());
    }
    match store.encrypt(plain) {
        Ok(blob) => ApiKeyMaterial::Sealed(blob),
        Err(e) => {
            warn!("Could not seal API key, storing it as plain text: {}", e);
            ApiKeyMaterial::Plain(plain.to_string())
        }
    }
}

/// Recover the key for request use. Any failure yields an empty key.
pub fn resolve_api_key(material: &ApiKeyMaterial, store: &dyn SecretStore) -> SecretString {
    match material {
        ApiKeyMaterial::Plain(key) => SecretString::from(key.clone()),
        ApiKeyMaterial::Sealed(blob) => match store.decrypt(blob) {
            Ok(key) => SecretString::from(key),
            Err(e) => {
                warn!("Could not decrypt the stored API key: {}", e);
                SecretString::from(String::new())
            }
        },
    }
}

/// Display form of a key: first 3 and last 4 characters, e.g. `hf_****wxyz`.
pub fn obfuscate_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 7 {
        return key.to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}
