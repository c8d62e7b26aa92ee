//! Stored credential rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Encrypted secret for one `(user_id, provider, kind)` key.
///
/// The plaintext never appears in this type; `encrypted_value` is the
/// base64 ciphertext produced by the secret cipher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub user_id: String,
    pub provider: String,
    /// Credential type, for example `api_key` or `oauth_token`.
    #[serde(rename = "type")]
    pub kind: String,
    pub encrypted_value: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub is_valid: bool,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the row may be handed to a provider at `now`.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.is_valid && self.expires_at.is_none_or(|expires_at| expires_at > now)
    }

    /// Uniqueness key of the row.
    pub fn key(&self) -> (&str, &str, &str) {
        (self.user_id.as_str(), self.provider.as_str(), self.kind.as_str())
    }
}
