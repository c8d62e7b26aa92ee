//! Shared helpers for the autoflow workspace: secret encryption, master-key
//! resolution, configuration loading and log-safe text handling.

use once_cell::sync::Lazy;
use regex::Regex;

pub mod config;
pub mod crypto;
pub mod keystore;

pub use config::{CONFIG_PATH_ENV, ConfigError, EngineConfig, RetrySettings, SchedulerSettings, WebhookSettings};
pub use crypto::{CipherError, KEY_SIZE, SecretCipher};
pub use keystore::{MASTER_KEY_ENV_VAR, MasterKeyError, SECRETS_BACKEND_ENV_VAR, SecretsBackend, load_master_key, secrets_backend};

/// Default number of characters kept in a log preview.
pub const DEFAULT_PREVIEW_CHARS: usize = 500;

static SENSITIVE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(bearer )([\w\-\.=:/+]+)",
        r"(?i)(authorization: )([\w\-\.=:/+]+)",
        r"(?i)([A-Z0-9_]*?(KEY|TOKEN|SECRET|PASSWORD)=)([^\s&]+)",
        r#"(?i)("[a-z0-9_]*(key|token|secret|password)"\s*:\s*)("[^"]*")"#,
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Redacts values that look like secrets in a string.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for re in SENSITIVE_PATTERNS.iter() {
        redacted = re
            .replace_all(&redacted, |caps: &regex::Captures| {
                let prefix = caps.get(1).map(|m| m.as_str()).unwrap_or("");
                format!("{}<redacted>", prefix)
            })
            .to_string();
    }
    redacted
}

/// Truncates `input` to at most `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_preview(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut truncated: String = input.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

/// Redacted, truncated rendering of a JSON value for log rows.
pub fn preview_json(value: &serde_json::Value, max_chars: usize) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let rendered = match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    Some(truncate_preview(&redact_sensitive(&rendered), max_chars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_tokens_and_headers() {
        let redacted = redact_sensitive("Authorization: Bearer abc123 API_KEY=xyz");
        assert!(!redacted.contains("abc123"));
        assert!(!redacted.contains("xyz"));
        assert!(redacted.contains("API_KEY=<redacted>"));
    }

    #[test]
    fn redacts_secret_json_fields() {
        let redacted = redact_sensitive(r#"{"api_key": "sk-live", "name": "ok"}"#);
        assert!(!redacted.contains("sk-live"));
        assert!(redacted.contains("\"name\": \"ok\""));
    }

    #[test]
    fn truncates_on_character_boundaries() {
        assert_eq!(truncate_preview("héllo", 10), "héllo");
        assert_eq!(truncate_preview("héllo", 2), "hé…");
    }

    #[test]
    fn previews_skip_null_and_unquote_strings() {
        assert_eq!(preview_json(&json!(null), 10), None);
        assert_eq!(preview_json(&json!("plain"), 10).as_deref(), Some("plain"));
        assert_eq!(preview_json(&json!({"id": 42}), 100).as_deref(), Some("{\"id\":42}"));
    }
}
