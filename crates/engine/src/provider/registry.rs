use std::{
    collections::HashMap,
    fmt,
    panic::AssertUnwindSafe,
    sync::Arc,
};

use autoflow_types::{ProviderErrorKind, ProviderResult};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use super::ProviderHandler;
use crate::credentials::Credentials;

/// Lookup of an unregistered provider key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("provider '{0}' is not registered")]
pub struct ProviderNotFound(pub String);

/// Registry of provider handlers keyed by provider identifier.
///
/// Registration takes a write lock for the whole batch, so concurrent readers
/// either see a handler fully registered or not at all. Lookups clone the
/// handler `Arc` and release the lock before the call, so a slow provider
/// never blocks registration or other lookups.
#[derive(Default)]
pub struct ProviderRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ProviderHandler>>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry").field("providers", &self.providers()).finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `key` with `handler`, replacing any previous handler.
    pub fn register(&self, key: impl Into<String>, handler: Arc<dyn ProviderHandler>) {
        let key = key.into();
        let replaced = self.handlers.write().insert(key.clone(), handler).is_some();
        info!(provider = %key, replaced, "provider registered");
    }

    /// Register several handlers atomically.
    pub fn register_all<I>(&self, handlers: I)
    where
        I: IntoIterator<Item = (String, Arc<dyn ProviderHandler>)>,
    {
        let mut table = self.handlers.write();
        for (key, handler) in handlers {
            debug!(provider = %key, "provider registered");
            table.insert(key, handler);
        }
    }

    /// Whether `key` has a handler.
    pub fn contains(&self, key: &str) -> bool {
        self.handlers.read().contains_key(key)
    }

    /// Sorted list of registered provider keys.
    pub fn providers(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Look up the handler for `key`.
    pub fn handler(&self, key: &str) -> Result<Arc<dyn ProviderHandler>, ProviderNotFound> {
        self.handlers
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ProviderNotFound(key.to_string()))
    }

    /// Look up and call the handler for `key`.
    pub async fn invoke(
        &self,
        key: &str,
        action: &str,
        params: &Map<String, Value>,
        credentials: &Credentials,
    ) -> Result<ProviderResult, ProviderNotFound> {
        let handler = self.handler(key)?;
        Ok(invoke_handler(handler.as_ref(), key, action, params, credentials).await)
    }
}

/// Call a handler, converting a panic into a rejected failure result.
pub(crate) async fn invoke_handler(
    handler: &dyn ProviderHandler,
    key: &str,
    action: &str,
    params: &Map<String, Value>,
    credentials: &Credentials,
) -> ProviderResult {
    match AssertUnwindSafe(handler.invoke(action, params, credentials)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            error!(provider = %key, action = %action, "provider handler panicked");
            ProviderResult::failure(
                ProviderErrorKind::Rejected,
                format!("provider '{key}' failed unexpectedly while running '{action}'"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ProviderHandler for Echo {
        async fn invoke(&self, action: &str, params: &Map<String, Value>, _credentials: &Credentials) -> ProviderResult {
            ProviderResult::ok(json!({"action": action, "params": params}), "echoed")
        }
    }

    struct Panics;

    #[async_trait]
    impl ProviderHandler for Panics {
        async fn invoke(&self, _action: &str, _params: &Map<String, Value>, _credentials: &Credentials) -> ProviderResult {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn invoke_dispatches_to_registered_handler() {
        let registry = ProviderRegistry::new();
        registry.register("echo", Arc::new(Echo));

        let mut params = Map::new();
        params.insert("x".into(), json!(1));
        let result = registry
            .invoke("echo", "run", &params, &Credentials::default())
            .await
            .expect("registered");

        assert!(result.success);
        assert_eq!(result.output, json!({"action": "run", "params": {"x": 1}}));
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let registry = ProviderRegistry::new();
        let error = registry
            .invoke("missing", "run", &Map::new(), &Credentials::default())
            .await
            .expect_err("not registered");
        assert_eq!(error, ProviderNotFound("missing".into()));
    }

    #[tokio::test]
    async fn panicking_handler_becomes_rejected_failure() {
        let registry = ProviderRegistry::new();
        registry.register("broken", Arc::new(Panics));
        let result = registry
            .invoke("broken", "run", &Map::new(), &Credentials::default())
            .await
            .expect("registered");
        assert!(!result.success);
        assert_eq!(result.failure_kind(), Some(ProviderErrorKind::Rejected));
    }

    #[test]
    fn register_all_publishes_every_handler() {
        let registry = ProviderRegistry::new();
        registry.register_all([
            ("b".to_string(), Arc::new(Echo) as Arc<dyn ProviderHandler>),
            ("a".to_string(), Arc::new(Echo)),
        ]);
        assert_eq!(registry.providers(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.contains("a"));
    }

    #[test]
    fn concurrent_lookups_during_registration_see_whole_handlers() {
        let registry = Arc::new(ProviderRegistry::new());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(handler) = registry.handler("late") {
                            assert!(handler.actions().is_empty());
                        }
                    }
                })
            })
            .collect();
        for index in 0..50 {
            registry.register(format!("p{index}"), Arc::new(Echo));
        }
        registry.register("late", Arc::new(Echo));
        for reader in readers {
            reader.join().expect("reader thread");
        }
        assert_eq!(registry.providers().len(), 51);
    }
}
