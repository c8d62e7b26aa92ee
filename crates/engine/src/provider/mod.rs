//! Provider handlers and the registry that maps provider keys to them.
//!
//! Modules:
//! - `registry`: Concurrent provider lookup table
//! - `http`: Generic HTTP and outbound webhook providers
//! - `logic`: Pure data-shaping provider with no network access

mod http;
mod logic;
mod registry;

pub use http::{HttpProvider, WebhookProvider};
pub use logic::LogicProvider;
pub use registry::{ProviderNotFound, ProviderRegistry};
pub(crate) use registry::invoke_handler;

use std::sync::Arc;

use async_trait::async_trait;
use autoflow_types::ProviderResult;
use serde_json::{Map, Value};

use crate::credentials::Credentials;

/// Executable capability behind a provider key.
///
/// Every handler normalizes its outcome to [`ProviderResult`]. Runtime
/// failures are returned as `success = false` results, never as panics or
/// errors, so the engine can apply its retry policy uniformly.
#[async_trait]
pub trait ProviderHandler: Send + Sync {
    /// Run `action` with already-resolved parameters and decrypted credentials.
    async fn invoke(&self, action: &str, params: &Map<String, Value>, credentials: &Credentials) -> ProviderResult;

    /// Credential types that must be present before `action` may run.
    fn required_credentials(&self, _action: &str) -> Vec<String> {
        Vec::new()
    }

    /// Actions understood by this handler, for listings and diagnostics.
    fn actions(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

/// Register the built-in providers under their default keys.
pub fn register_builtin_providers(registry: &ProviderRegistry) -> Result<(), reqwest::Error> {
    let http = HttpProvider::new()?;
    let webhook = WebhookProvider::from_http(http.clone());
    registry.register_all([
        ("http".to_string(), Arc::new(http) as Arc<dyn ProviderHandler>),
        ("webhook".to_string(), Arc::new(webhook)),
        ("logic".to_string(), Arc::new(LogicProvider)),
    ]);
    Ok(())
}
