//! Stored credentials for custom configs
//!
//! Keyed by config file name. The keyring store keeps each entry as a JSON
//! blob under one OS credential (Secret Service, Keychain, Credential Manager).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

const KEYRING_SERVICE: &str = "vpn-orchestrator";

#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("Corrupt stored credentials: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConfigCredentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub priv_key_password: String,
}

impl CustomConfigCredentials {
    pub fn has_username_and_password(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty() && self.priv_key_password.is_empty()
    }
}

/// Credentials persistence; implementors provide `load`/`store` of the
/// whole entry and get the field-level operations for free
pub trait CredentialStore: Send + Sync {
    fn load(&self, config_name: &str) -> CustomConfigCredentials;
    fn store(&self, config_name: &str, creds: &CustomConfigCredentials);

    fn get(&self, config_name: &str) -> CustomConfigCredentials {
        self.load(config_name)
    }

    fn set_username_and_password(&self, config_name: &str, username: &str, password: &str) {
        let mut creds = self.load(config_name);
        creds.username = username.to_string();
        creds.password = password.to_string();
        self.store(config_name, &creds);
    }

    fn set_password(&self, config_name: &str, password: &str) {
        let mut creds = self.load(config_name);
        creds.password = password.to_string();
        self.store(config_name, &creds);
    }

    fn set_priv_key_password(&self, config_name: &str, password: &str) {
        let mut creds = self.load(config_name);
        creds.priv_key_password = password.to_string();
        self.store(config_name, &creds);
    }

    fn remove_credentials(&self, config_name: &str) {
        let mut creds = self.load(config_name);
        creds.username.clear();
        creds.password.clear();
        self.store(config_name, &creds);
    }

    fn remove_priv_key_password(&self, config_name: &str) {
        let mut creds = self.load(config_name);
        creds.priv_key_password.clear();
        self.store(config_name, &creds);
    }
}

/// Process-lifetime store
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: Mutex<HashMap<String, CustomConfigCredentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, config_name: &str) -> CustomConfigCredentials {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(config_name).cloned().unwrap_or_default()
    }

    fn store(&self, config_name: &str, creds: &CustomConfigCredentials) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if creds.is_empty() {
            entries.remove(config_name);
        } else {
            entries.insert(config_name.to_string(), creds.clone());
        }
    }
}

/// OS keyring backed store
pub struct KeyringCredentialStore {
    service: String,
}

impl KeyringCredentialStore {
    pub fn new() -> Self {
        Self {
            service: KEYRING_SERVICE.to_string(),
        }
    }

    fn try_load(&self, config_name: &str) -> Result<CustomConfigCredentials, CredentialsError> {
        let entry = keyring::Entry::new(&self.service, config_name)?;
        match entry.get_password() {
            Ok(blob) => Ok(serde_json::from_str(&blob)?),
            Err(keyring::Error::NoEntry) => Ok(CustomConfigCredentials::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn try_store(
        &self,
        config_name: &str,
        creds: &CustomConfigCredentials,
    ) -> Result<(), CredentialsError> {
        let entry = keyring::Entry::new(&self.service, config_name)?;
        if creds.is_empty() {
            return match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        entry.set_password(&serde_json::to_string(creds)?)?;
        Ok(())
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load(&self, config_name: &str) -> CustomConfigCredentials {
        self.try_load(config_name).unwrap_or_else(|e| {
            warn!("Failed to read stored credentials for {}: {}", config_name, e);
            CustomConfigCredentials::default()
        })
    }

    fn store(&self, config_name: &str, creds: &CustomConfigCredentials) {
        match self.try_store(config_name, creds) {
            Ok(()) => debug!("Stored credentials updated for {}", config_name),
            Err(e) => warn!("Failed to store credentials for {}: {}", config_name, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.get("home.ovpn"), CustomConfigCredentials::default());

        store.set_username_and_password("home.ovpn", "alice", "s3cret");
        store.set_priv_key_password("home.ovpn", "keypass");
        let creds = store.get("home.ovpn");
        assert!(creds.has_username_and_password());
        assert_eq!(creds.priv_key_password, "keypass");
    }

    #[test]
    fn test_remove_credentials_keeps_priv_key_password() {
        let store = MemoryCredentialStore::new();
        store.set_username_and_password("home.ovpn", "alice", "s3cret");
        store.set_priv_key_password("home.ovpn", "keypass");

        store.remove_credentials("home.ovpn");
        let creds = store.get("home.ovpn");
        assert!(!creds.has_username_and_password());
        assert_eq!(creds.priv_key_password, "keypass");

        store.remove_priv_key_password("home.ovpn");
        assert!(store.entries.lock().unwrap().is_empty());
    }

    #[test]
    fn test_set_password_only() {
        let store = MemoryCredentialStore::new();
        store.set_password("work.ovpn", "pw");
        let creds = store.get("work.ovpn");
        assert_eq!(creds.password, "pw");
        assert!(creds.username.is_empty());
    }

    #[test]
    fn test_blob_format() {
        let creds = CustomConfigCredentials {
            username: "alice".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&creds).unwrap();
        let parsed: CustomConfigCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, creds);
        let partial: CustomConfigCredentials = serde_json::from_str(r#"{"username":"bob"}"#).unwrap();
        assert_eq!(partial.username, "bob");
    }
}
