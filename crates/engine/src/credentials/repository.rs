//! Persistence backends for encrypted credential rows.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use autoflow_types::Credential;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::CredentialError;

/// Storage of encrypted rows, always addressed through a `user_id`.
pub trait CredentialRepository: Send + Sync {
    /// Insert or replace the row with the same `(user_id, provider, kind)`.
    fn upsert(&self, credential: Credential) -> Result<(), CredentialError>;
    /// All rows, valid or not, for one user and provider.
    fn rows_for(&self, user_id: &str, provider: &str) -> Result<Vec<Credential>, CredentialError>;
    /// Mark a row invalid. Returns false when no such row exists.
    fn mark_invalid(&self, user_id: &str, provider: &str, kind: &str) -> Result<bool, CredentialError>;
}

type TenantRows = HashMap<String, Vec<Credential>>;

fn upsert_row(rows: &mut Vec<Credential>, credential: Credential) {
    match rows
        .iter_mut()
        .find(|row| row.provider == credential.provider && row.kind == credential.kind)
    {
        Some(existing) => *existing = credential,
        None => rows.push(credential),
    }
}

fn invalidate_row(rows: Option<&mut Vec<Credential>>, provider: &str, kind: &str) -> bool {
    let Some(row) = rows.and_then(|rows| rows.iter_mut().find(|row| row.provider == provider && row.kind == kind)) else {
        return false;
    };
    row.is_valid = false;
    true
}

/// In-process repository keyed by tenant.
#[derive(Debug, Default)]
pub struct MemoryCredentialRepository {
    tenants: Mutex<TenantRows>,
}

impl MemoryCredentialRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialRepository for MemoryCredentialRepository {
    fn upsert(&self, credential: Credential) -> Result<(), CredentialError> {
        let mut tenants = self.tenants.lock();
        upsert_row(tenants.entry(credential.user_id.clone()).or_default(), credential);
        Ok(())
    }

    fn rows_for(&self, user_id: &str, provider: &str) -> Result<Vec<Credential>, CredentialError> {
        Ok(self
            .tenants
            .lock()
            .get(user_id)
            .map(|rows| rows.iter().filter(|row| row.provider == provider).cloned().collect())
            .unwrap_or_default())
    }

    fn mark_invalid(&self, user_id: &str, provider: &str, kind: &str) -> Result<bool, CredentialError> {
        Ok(invalidate_row(self.tenants.lock().get_mut(user_id), provider, kind))
    }
}

/// JSON file repository; the whole table is rewritten on each mutation.
#[derive(Debug)]
pub struct FileCredentialRepository {
    path: PathBuf,
    tenants: Mutex<TenantRows>,
}

impl FileCredentialRepository {
    /// Open (or lazily create) the repository at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let path = path.into();
        let tenants = load_rows(&path)?;
        debug!(path = %path.display(), tenants = tenants.len(), "credential repository opened");
        Ok(Self {
            path,
            tenants: Mutex::new(tenants),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save_locked(&self, tenants: &TenantRows) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|error| storage_error(&self.path, error))?;
        }
        let ordered: BTreeMap<&String, &Vec<Credential>> = tenants.iter().collect();
        let data = serde_json::to_string_pretty(&ordered).map_err(|error| CredentialError::Storage(error.to_string()))?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, data).map_err(|error| storage_error(&staging, error))?;
        fs::rename(&staging, &self.path).map_err(|error| storage_error(&self.path, error))?;
        Ok(())
    }
}

impl CredentialRepository for FileCredentialRepository {
    fn upsert(&self, credential: Credential) -> Result<(), CredentialError> {
        let mut tenants = self.tenants.lock();
        let mut staged = tenants.clone();
        upsert_row(staged.entry(credential.user_id.clone()).or_default(), credential);
        self.save_locked(&staged)?;
        *tenants = staged;
        Ok(())
    }

    fn rows_for(&self, user_id: &str, provider: &str) -> Result<Vec<Credential>, CredentialError> {
        Ok(self
            .tenants
            .lock()
            .get(user_id)
            .map(|rows| rows.iter().filter(|row| row.provider == provider).cloned().collect())
            .unwrap_or_default())
    }

    fn mark_invalid(&self, user_id: &str, provider: &str, kind: &str) -> Result<bool, CredentialError> {
        let mut tenants = self.tenants.lock();
        let mut staged = tenants.clone();
        if !invalidate_row(staged.get_mut(user_id), provider, kind) {
            return Ok(false);
        }
        self.save_locked(&staged)?;
        *tenants = staged;
        Ok(true)
    }
}

fn load_rows(path: &Path) -> Result<TenantRows, CredentialError> {
    match fs::read_to_string(path) {
        Ok(data) if data.trim().is_empty() => Ok(TenantRows::new()),
        Ok(data) => serde_json::from_str(&data).map_err(|error| {
            warn!(path = %path.display(), error = %error, "failed to parse credential file");
            CredentialError::Storage(format!("parse {}: {error}", path.display()))
        }),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(TenantRows::new()),
        Err(error) => Err(storage_error(path, error)),
    }
}

fn storage_error(path: &Path, error: std::io::Error) -> CredentialError {
    CredentialError::Storage(format!("{}: {error}", path.display()))
}
