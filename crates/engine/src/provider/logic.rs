//! Data-shaping provider that never leaves the process.
//!
//! Useful for assembling intermediate values that later steps reference.

use async_trait::async_trait;
use autoflow_types::{ProviderErrorKind, ProviderResult};
use serde_json::{Map, Value};

use super::ProviderHandler;
use crate::credentials::Credentials;

const LOGIC_ACTIONS: [&str; 4] = ["echo", "set", "template", "merge"];

/// Built-in `logic` provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogicProvider;

#[async_trait]
impl ProviderHandler for LogicProvider {
    async fn invoke(&self, action: &str, params: &Map<String, Value>, _credentials: &Credentials) -> ProviderResult {
        match action {
            // `value` when given, otherwise every parameter.
            "echo" => {
                let output = params.get("value").cloned().unwrap_or_else(|| Value::Object(params.clone()));
                ProviderResult::ok(output, "echoed")
            }
            "set" => ProviderResult::ok(Value::Object(params.clone()), format!("set {} value(s)", params.len())),
            "template" => match params.get("template") {
                Some(Value::String(text)) => ProviderResult::ok(Value::String(text.clone()), "rendered"),
                Some(other) => ProviderResult::ok(Value::String(other.to_string()), "rendered"),
                None => ProviderResult::failure(ProviderErrorKind::Rejected, "missing required parameter 'template'"),
            },
            "merge" => merge_objects(params.get("objects")),
            other => ProviderResult::failure(ProviderErrorKind::Rejected, format!("unsupported logic action '{other}'")),
        }
    }

    fn actions(&self) -> Vec<&'static str> {
        LOGIC_ACTIONS.to_vec()
    }
}

/// Shallow merge, later objects winning on key conflicts.
fn merge_objects(objects: Option<&Value>) -> ProviderResult {
    let Some(Value::Array(objects)) = objects else {
        return ProviderResult::failure(ProviderErrorKind::Rejected, "parameter 'objects' must be an array");
    };
    let mut merged = Map::new();
    for (index, object) in objects.iter().enumerate() {
        match object {
            Value::Object(entries) => merged.extend(entries.iter().map(|(key, value)| (key.clone(), value.clone()))),
            Value::Null => {}
            _ => {
                return ProviderResult::failure(
                    ProviderErrorKind::Rejected,
                    format!("objects[{index}] is not an object"),
                );
            }
        }
    }
    ProviderResult::ok(Value::Object(merged), format!("merged {} object(s)", objects.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn invoke(action: &str, params: Value) -> ProviderResult {
        let params = params.as_object().cloned().unwrap_or_default();
        LogicProvider.invoke(action, &params, &Credentials::new()).await
    }

    #[tokio::test]
    async fn echo_prefers_value_parameter() {
        assert_eq!(invoke("echo", json!({"value": [1, 2]})).await.output, json!([1, 2]));
        assert_eq!(invoke("echo", json!({"a": 1})).await.output, json!({"a": 1}));
    }

    #[tokio::test]
    async fn merge_combines_objects_in_order() {
        let result = invoke("merge", json!({"objects": [{"a": 1, "b": 1}, null, {"b": 2}]})).await;
        assert!(result.success);
        assert_eq!(result.output, json!({"a": 1, "b": 2}));

        let bad = invoke("merge", json!({"objects": [1]})).await;
        assert_eq!(bad.failure_kind(), Some(ProviderErrorKind::Rejected));
    }

    #[tokio::test]
    async fn template_returns_rendered_text() {
        let result = invoke("template", json!({"template": "Hello Ada"})).await;
        assert_eq!(result.output, json!("Hello Ada"));
        assert!(!invoke("template", json!({})).await.success);
    }

    #[tokio::test]
    async fn unknown_action_is_rejected() {
        let result = invoke("teleport", json!({})).await;
        assert_eq!(result.failure_kind(), Some(ProviderErrorKind::Rejected));
    }
}
