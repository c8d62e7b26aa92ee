//! Loads the process-wide credential master key from the environment or the
//! OS keychain.

use thiserror::Error;
use tracing::debug;

use crate::crypto::{CipherError, SecretCipher};

static SERVICE: &str = "autoflow";
/// Keychain entry holding the base64 master key.
pub const MASTER_KEY_ENTRY: &str = "credential-master-key";
/// Environment variable used to select the secret resolution backend.
pub const SECRETS_BACKEND_ENV_VAR: &str = "AUTOFLOW_SECRETS_BACKEND";
/// Environment variable holding the base64 master key in environment mode.
pub const MASTER_KEY_ENV_VAR: &str = "AUTOFLOW_MASTER_KEY";

/// Secret resolution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretsBackend {
    /// Read the master key from the OS keychain (`keyring-rs`).
    Keychain,
    /// Read the master key from `AUTOFLOW_MASTER_KEY`.
    Environment,
}

impl SecretsBackend {
    fn from_env_var(raw: Option<String>) -> Self {
        match raw.unwrap_or_default().trim().to_ascii_lowercase().as_str() {
            "env" => Self::Environment,
            _ => Self::Keychain,
        }
    }
}

/// Determine the currently configured secrets backend.
pub fn secrets_backend() -> SecretsBackend {
    let configured_value = std::env::var(SECRETS_BACKEND_ENV_VAR).ok();
    SecretsBackend::from_env_var(configured_value)
}

/// Errors raised while loading or storing the master key.
#[derive(Debug, Error, Clone)]
pub enum MasterKeyError {
    #[error("missing master key: {name} - {error}")]
    Missing { name: String, error: String },

    #[error("keyring error for {name}: {error}")]
    Keyring { name: String, error: String },

    #[error(transparent)]
    Cipher(#[from] CipherError),
}

/// Load the master key with the configured backend and build a cipher from it.
pub fn load_master_key() -> Result<SecretCipher, MasterKeyError> {
    let encoded = match secrets_backend() {
        SecretsBackend::Environment => std::env::var(MASTER_KEY_ENV_VAR).map_err(|error| MasterKeyError::Missing {
            name: MASTER_KEY_ENV_VAR.to_string(),
            error: error.to_string(),
        })?,
        SecretsBackend::Keychain => keychain_entry()?.get_password().map_err(|e| MasterKeyError::Missing {
            name: MASTER_KEY_ENTRY.to_string(),
            error: e.to_string(),
        })?,
    };
    debug!(backend = ?secrets_backend(), "loaded credential master key");
    Ok(SecretCipher::from_base64(&encoded)?)
}

/// Store a base64 master key in the OS keychain.
pub fn store_master_key(encoded: &str) -> Result<(), MasterKeyError> {
    SecretCipher::from_base64(encoded)?;
    keychain_entry()?.set_password(encoded).map_err(|e| MasterKeyError::Keyring {
        name: MASTER_KEY_ENTRY.to_string(),
        error: e.to_string(),
    })?;
    debug!("stored credential master key in keychain");
    Ok(())
}

/// Remove the master key from the OS keychain.
pub fn remove_master_key() -> Result<(), MasterKeyError> {
    keychain_entry()?.delete_credential().map_err(|e| MasterKeyError::Keyring {
        name: MASTER_KEY_ENTRY.to_string(),
        error: e.to_string(),
    })?;
    debug!("removed credential master key from keychain");
    Ok(())
}

fn keychain_entry() -> Result<keyring::Entry, MasterKeyError> {
    keyring::Entry::new(SERVICE, MASTER_KEY_ENTRY).map_err(|e| MasterKeyError::Keyring {
        name: MASTER_KEY_ENTRY.to_string(),
        error: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_backend_defaults_to_keychain_when_env_var_is_missing() {
        temp_env::with_var(SECRETS_BACKEND_ENV_VAR, None::<&str>, || {
            assert_eq!(secrets_backend(), SecretsBackend::Keychain);
        });
    }

    #[test]
    fn secrets_backend_uses_environment_when_configured() {
        temp_env::with_var(SECRETS_BACKEND_ENV_VAR, Some("ENV"), || {
            assert_eq!(secrets_backend(), SecretsBackend::Environment);
        });
    }

    #[test]
    fn load_master_key_reads_process_environment_in_environment_mode() {
        let key = SecretCipher::generate_key();
        temp_env::with_vars(
            [(SECRETS_BACKEND_ENV_VAR, Some("env")), (MASTER_KEY_ENV_VAR, Some(key.as_str()))],
            || {
                let cipher = load_master_key().expect("master key resolves from environment");
                let encrypted = cipher.encrypt("value").expect("encrypt");
                assert_eq!(cipher.decrypt(&encrypted).expect("decrypt"), "value");
            },
        );
    }

    #[test]
    fn load_master_key_reports_missing_variable() {
        temp_env::with_vars(
            [(SECRETS_BACKEND_ENV_VAR, Some("env")), (MASTER_KEY_ENV_VAR, None::<&str>)],
            || {
                assert!(matches!(load_master_key(), Err(MasterKeyError::Missing { .. })));
            },
        );
    }
}
