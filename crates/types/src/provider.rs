//! Normalized provider response shape.
//!
//! Every provider handler returns a [`ProviderResult`], whatever external API
//! it wraps, so the engine never special-cases individual integrations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Failure classification reported by a provider handler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// 5xx-equivalent or network failure.
    Transient,
    /// The call did not complete within its deadline.
    Timeout,
    /// The remote side throttled the caller.
    RateLimited,
    /// The supplied credential was refused.
    Authentication,
    /// The request was refused for a reason retrying cannot fix.
    Rejected,
}

/// Fixed-shape outcome of a provider call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderResult {
    pub success: bool,
    #[serde(default)]
    pub output: JsonValue,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
    /// Absent on failures is read as [`ProviderErrorKind::Transient`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ProviderErrorKind>,
}

impl ProviderResult {
    /// Successful result carrying `output`.
    pub fn ok(output: JsonValue, message: impl Into<String>) -> Self {
        Self {
            success: true,
            output,
            message: message.into(),
            ..Default::default()
        }
    }

    /// Failed result with an explicit classification.
    pub fn failure(kind: ProviderErrorKind, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output: JsonValue::Null,
            message: error.clone(),
            metadata: Map::new(),
            error: Some(error),
            error_kind: Some(kind),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Effective failure classification; `None` for successful results.
    pub fn failure_kind(&self) -> Option<ProviderErrorKind> {
        if self.success {
            None
        } else {
            Some(self.error_kind.unwrap_or(ProviderErrorKind::Transient))
        }
    }

    /// Error text for failed results, falling back to the message.
    pub fn error_text(&self) -> String {
        self.error
            .clone()
            .filter(|error| !error.is_empty())
            .unwrap_or_else(|| if self.message.is_empty() { "provider call failed".to_string() } else { self.message.clone() })
    }
}
