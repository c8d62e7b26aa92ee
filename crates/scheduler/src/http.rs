//! HTTP surface for webhook triggers.

use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::webhook::{WebhookError, WebhookRouter};

/// Listener configuration for inbound webhooks.
pub struct WebhookServer {
    bind_address: SocketAddr,
    router: WebhookRouter,
}

impl WebhookServer {
    pub fn new(bind_address: SocketAddr, router: WebhookRouter) -> Self {
        Self { bind_address, router }
    }

    /// Bind and serve `POST /hooks/{*path}` until stopped.
    pub async fn start(self) -> Result<RunningWebhookServer> {
        let cancellation_token = CancellationToken::new();
        let app = Router::new()
            .route("/hooks/{*path}", post(receive_webhook))
            .route("/health", get(|| async { "ok" }))
            .with_state(self.router);

        let listener = tokio::net::TcpListener::bind(self.bind_address).await?;
        let bound_address = listener.local_addr()?;
        info!(address = %bound_address, "webhook server listening");

        let server_handle = tokio::spawn({
            let shutdown = cancellation_token.child_token();
            async move {
                if let Err(serve_error) = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        shutdown.cancelled().await;
                    })
                    .await
                {
                    error!(error = %serve_error, "webhook server failed");
                }
            }
        });

        Ok(RunningWebhookServer {
            bind_address: bound_address,
            cancellation_token,
            server_handle,
        })
    }
}

/// Handle for a started [`WebhookServer`].
#[derive(Debug)]
pub struct RunningWebhookServer {
    bind_address: SocketAddr,
    cancellation_token: CancellationToken,
    server_handle: JoinHandle<()>,
}

impl RunningWebhookServer {
    pub fn bound_address(&self) -> SocketAddr {
        self.bind_address
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn stop(self) -> Result<()> {
        self.cancellation_token.cancel();
        self.server_handle
            .await
            .map_err(|join_error| anyhow!("webhook server task failed: {join_error}"))?;
        info!(address = %self.bind_address, "webhook server stopped");
        Ok(())
    }
}

async fn receive_webhook(State(router): State<WebhookRouter>, Path(path): Path<String>, body: Bytes) -> Response {
    let payload = parse_payload(&body);
    match router.handle(&path, payload).await {
        Ok(ticket) => (StatusCode::ACCEPTED, Json(json!({ "execution_id": ticket.execution_id }))).into_response(),
        Err(webhook_error) => {
            let status = status_for(&webhook_error);
            (status, Json(json!({ "error": webhook_error.to_string() }))).into_response()
        }
    }
}

/// JSON bodies are passed through; anything else arrives as a string.
fn parse_payload(body: &[u8]) -> Value {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn status_for(webhook_error: &WebhookError) -> StatusCode {
    match webhook_error {
        WebhookError::NotFound(_) => StatusCode::NOT_FOUND,
        WebhookError::Dispatch(dispatch_error) if dispatch_error.is_plan_rejection() => StatusCode::CONFLICT,
        WebhookError::Dispatch(_) | WebhookError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
