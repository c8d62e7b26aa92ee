//! Per-user, per-provider credential storage.
//!
//! Secrets are encrypted at rest with the process-wide [`SecretCipher`] and
//! decrypted only when a step needs them. Every lookup is keyed by
//! `user_id`; no operation can reach another tenant's rows.
//!
//! [`SecretCipher`]: autoflow_util::SecretCipher

mod repository;
mod vault;

use std::collections::BTreeMap;
use std::fmt;

use autoflow_util::CipherError;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use repository::{CredentialRepository, FileCredentialRepository, MemoryCredentialRepository};
pub use vault::CredentialVault;

/// Decrypted credentials for one provider, keyed by credential type.
///
/// `Debug` never prints values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: impl Into<String>, value: impl Into<String>) {
        self.0.insert(kind.into(), value.into());
    }

    pub fn get(&self, kind: &str) -> Option<&str> {
        self.0.get(kind).map(String::as_str)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.0.contains_key(kind)
    }

    /// Credential types present.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.keys().map(|kind| (kind, "<redacted>"))).finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Credentials {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(kind, value)| (kind.into(), value.into())).collect())
    }
}

/// Credential lookup or persistence failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("no valid {} credential for provider '{provider}'; reconnect {provider}", .kind.as_deref().unwrap_or("usable"))]
    Missing { provider: String, kind: Option<String> },
    #[error("credential cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("credential storage error: {0}")]
    Storage(String),
}

/// Encrypted credential store contract.
pub trait CredentialStore: Send + Sync {
    /// Decrypt every valid, non-expired credential of `provider` for `user_id`.
    /// Returns an empty set when there are none.
    fn usable(&self, user_id: &str, provider: &str) -> Result<Credentials, CredentialError>;

    /// Encrypt and upsert by `(user_id, provider, kind)`.
    fn store(
        &self,
        user_id: &str,
        provider: &str,
        kind: &str,
        plaintext: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CredentialError>;

    /// Flip `is_valid` to false without deleting the row.
    fn invalidate(&self, user_id: &str, provider: &str, kind: &str) -> Result<(), CredentialError>;

    /// Whether any row exists for `provider`, usable or not.
    fn has_stored(&self, user_id: &str, provider: &str) -> Result<bool, CredentialError>;

    /// Like [`CredentialStore::usable`] but fails when nothing usable exists.
    fn get(&self, user_id: &str, provider: &str) -> Result<Credentials, CredentialError> {
        let credentials = self.usable(user_id, provider)?;
        if credentials.is_empty() {
            return Err(CredentialError::Missing {
                provider: provider.to_string(),
                kind: None,
            });
        }
        Ok(credentials)
    }

    /// Usable credentials, failing when any of `kinds` is absent.
    fn require(&self, user_id: &str, provider: &str, kinds: &[String]) -> Result<Credentials, CredentialError> {
        let credentials = self.usable(user_id, provider)?;
        if let Some(missing) = kinds.iter().find(|kind| !credentials.contains(kind)) {
            return Err(CredentialError::Missing {
                provider: provider.to_string(),
                kind: Some(missing.clone()),
            });
        }
        Ok(credentials)
    }

    /// Credentials handed to one step.
    ///
    /// Declared `kinds` must all be usable. Without declarations a provider
    /// may run anonymously, unless the user connected it and every stored
    /// row has since expired or been invalidated.
    fn for_step(&self, user_id: &str, provider: &str, kinds: &[String]) -> Result<Credentials, CredentialError> {
        if !kinds.is_empty() {
            return self.require(user_id, provider, kinds);
        }
        let credentials = self.usable(user_id, provider)?;
        if credentials.is_empty() && self.has_stored(user_id, provider)? {
            return Err(CredentialError::Missing {
                provider: provider.to_string(),
                kind: None,
            });
        }
        Ok(credentials)
    }
}
