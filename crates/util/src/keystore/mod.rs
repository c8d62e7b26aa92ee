//! Master key resolution for credential encryption.

mod master_key;

pub use master_key::{
    MASTER_KEY_ENV_VAR, MASTER_KEY_ENTRY, MasterKeyError, SECRETS_BACKEND_ENV_VAR, SecretsBackend, load_master_key, remove_master_key,
    secrets_backend, store_master_key,
};
