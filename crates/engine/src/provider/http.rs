//! Generic HTTP provider and the outbound webhook provider built on it.
//!
//! Parameters:
//! - `url` (required): absolute request URL
//! - `headers`: object of header names to string values
//! - `query`: object appended as query string pairs
//! - `body`: JSON body for methods that carry one
//!
//! An `api_key` credential, when present, is sent as a bearer token.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use autoflow_types::{ProviderErrorKind, ProviderResult};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::ProviderHandler;
use crate::credentials::Credentials;

/// Credential type attached as `Authorization: Bearer`.
pub const API_KEY_CREDENTIAL: &str = "api_key";

const HTTP_ACTIONS: [&str; 5] = ["get", "post", "put", "patch", "delete"];

/// Performs arbitrary HTTP requests described by step parameters.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
}

impl HttpProvider {
    pub fn new() -> Result<Self, reqwest::Error> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(default_headers)
            .user_agent(format!("autoflow/{}; {}", env!("CARGO_PKG_VERSION"), env::consts::OS))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn request(&self, method: Method, params: &Map<String, Value>, credentials: &Credentials) -> ProviderResult {
        let Some(url) = params.get("url").and_then(Value::as_str).filter(|url| !url.trim().is_empty()) else {
            return ProviderResult::failure(ProviderErrorKind::Rejected, "missing required parameter 'url'");
        };

        let headers = match build_headers(params.get("headers")) {
            Ok(headers) => headers,
            Err(reason) => return ProviderResult::failure(ProviderErrorKind::Rejected, reason),
        };

        let mut builder = self.client.request(method.clone(), url).headers(headers);
        if let Some(api_key) = credentials.get(API_KEY_CREDENTIAL) {
            builder = builder.bearer_auth(api_key);
        }
        if let Some(Value::Object(query)) = params.get("query") {
            let pairs: Vec<(String, String)> = query.iter().map(|(key, value)| (key.clone(), query_value(value))).collect();
            builder = builder.query(&pairs);
        }
        if let Some(body) = params.get("body").filter(|body| !body.is_null())
            && method != Method::GET
        {
            builder = match body {
                Value::String(text) => builder.body(text.clone()),
                other => builder.json(other),
            };
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                let kind = if error.is_timeout() {
                    ProviderErrorKind::Timeout
                } else if error.is_builder() {
                    ProviderErrorKind::Rejected
                } else {
                    ProviderErrorKind::Transient
                };
                return ProviderResult::failure(kind, format!("network error: {error}"));
            }
        };

        let status = response.status();
        let final_url = response.url().to_string();
        let text = response.text().await.unwrap_or_default();
        debug!(method = %method, status = status.as_u16(), "http provider response");
        let output = parse_response_body(&text);

        let result = if status.is_success() {
            ProviderResult::ok(output, format!("{method} {final_url} -> {}", status.as_u16()))
        } else {
            let mut failure = ProviderResult::failure(classify_status(status), format!("HTTP {}: {}", status.as_u16(), text.trim()));
            failure.output = output;
            failure
        };
        result
            .with_metadata("status_code", json!(status.as_u16()))
            .with_metadata("url", json!(final_url))
    }
}

#[async_trait]
impl ProviderHandler for HttpProvider {
    async fn invoke(&self, action: &str, params: &Map<String, Value>, credentials: &Credentials) -> ProviderResult {
        match Method::from_bytes(action.to_ascii_uppercase().as_bytes()) {
            Ok(method) if HTTP_ACTIONS.contains(&action.to_ascii_lowercase().as_str()) => {
                self.request(method, params, credentials).await
            }
            _ => ProviderResult::failure(ProviderErrorKind::Rejected, format!("unsupported http action '{action}'")),
        }
    }

    fn actions(&self) -> Vec<&'static str> {
        HTTP_ACTIONS.to_vec()
    }
}

/// Posts a JSON `payload` to `url`.
#[derive(Debug, Clone)]
pub struct WebhookProvider {
    http: HttpProvider,
}

impl WebhookProvider {
    pub fn from_http(http: HttpProvider) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ProviderHandler for WebhookProvider {
    async fn invoke(&self, action: &str, params: &Map<String, Value>, credentials: &Credentials) -> ProviderResult {
        if action != "send" {
            return ProviderResult::failure(ProviderErrorKind::Rejected, format!("unsupported webhook action '{action}'"));
        }
        let mut request = Map::new();
        if let Some(url) = params.get("url") {
            request.insert("url".into(), url.clone());
        }
        if let Some(headers) = params.get("headers") {
            request.insert("headers".into(), headers.clone());
        }
        request.insert("body".into(), params.get("payload").cloned().unwrap_or(Value::Null));
        self.http.request(Method::POST, &request, credentials).await
    }

    fn actions(&self) -> Vec<&'static str> {
        vec!["send"]
    }
}

/// Map an HTTP status to a provider failure kind.
pub fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::Authentication,
        408 => ProviderErrorKind::Timeout,
        429 => ProviderErrorKind::RateLimited,
        500..=599 => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Rejected,
    }
}

fn build_headers(value: Option<&Value>) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    let Some(value) = value.filter(|value| !value.is_null()) else {
        return Ok(headers);
    };
    let Value::Object(entries) = value else {
        return Err("parameter 'headers' must be an object".into());
    };
    for (name, value) in entries {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|error| format!("invalid header name '{name}': {error}"))?;
        let value = HeaderValue::from_str(&query_value(value)).map_err(|error| format!("invalid value for header '{name}': {error}"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn parse_response_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
