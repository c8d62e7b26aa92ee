use autoflow_types::Credential;
use autoflow_util::SecretCipher;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{CredentialError, CredentialRepository, CredentialStore, Credentials};

/// [`CredentialStore`] that encrypts values before handing them to a repository.
#[derive(Debug)]
pub struct CredentialVault<R> {
    repository: R,
    cipher: SecretCipher,
}

impl<R: CredentialRepository> CredentialVault<R> {
    pub fn new(repository: R, cipher: SecretCipher) -> Self {
        Self { repository, cipher }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    fn usable_at(&self, user_id: &str, provider: &str, now: DateTime<Utc>) -> Result<Credentials, CredentialError> {
        let mut credentials = Credentials::new();
        for row in self.repository.rows_for(user_id, provider)? {
            if !row.is_usable(now) {
                debug!(provider = %provider, kind = %row.kind, valid = row.is_valid, "skipping unusable credential");
                continue;
            }
            let plaintext = self.cipher.decrypt(&row.encrypted_value)?;
            credentials.insert(row.kind, plaintext);
        }
        Ok(credentials)
    }
}

impl<R: CredentialRepository> CredentialStore for CredentialVault<R> {
    fn usable(&self, user_id: &str, provider: &str) -> Result<Credentials, CredentialError> {
        self.usable_at(user_id, provider, Utc::now())
    }

    fn store(
        &self,
        user_id: &str,
        provider: &str,
        kind: &str,
        plaintext: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CredentialError> {
        let encrypted_value = self.cipher.encrypt(plaintext)?;
        self.repository.upsert(Credential {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            kind: kind.to_string(),
            encrypted_value,
            expires_at,
            is_valid: true,
            updated_at: Utc::now(),
        })?;
        info!(provider = %provider, kind = %kind, "credential stored");
        Ok(())
    }

    fn invalidate(&self, user_id: &str, provider: &str, kind: &str) -> Result<(), CredentialError> {
        if self.repository.mark_invalid(user_id, provider, kind)? {
            info!(provider = %provider, kind = %kind, "credential invalidated");
        } else {
            debug!(provider = %provider, kind = %kind, "no credential to invalidate");
        }
        Ok(())
    }

    fn has_stored(&self, user_id: &str, provider: &str) -> Result<bool, CredentialError> {
        Ok(!self.repository.rows_for(user_id, provider)?.is_empty())
    }
}
