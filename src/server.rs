//! HTTP surface: the LINE webhook, the operator's send endpoint and the
//! read endpoint the web chat polls.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::error::RelayError;
use crate::platform::line::WebhookBody;
use crate::relay::Relay;
use crate::store::Message;

#[derive(Deserialize)]
struct SendRequest {
    text: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        if self.is_client_error() {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": self.to_string() })))
                .into_response();
        }
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "details": self.to_string() })),
        )
            .into_response()
    }
}

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/messages", get(list_messages))
        .route("/api/line/webhook", post(webhook))
        .route("/api/line/send", post(send))
        .with_state(relay)
}

/// Serve until Ctrl-C.
pub async fn serve(relay: Arc<Relay>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {bind}"))?;

    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(relay))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .context("Server error")?;

    Ok(())
}

async fn health(State(relay): State<Arc<Relay>>) -> Json<Value> {
    Json(json!({ "status": "running", "backend": relay.backend_name() }))
}

async fn list_messages(
    State(relay): State<Arc<Relay>>,
) -> Result<Json<Vec<Message>>, RelayError> {
    let messages = relay.messages().await.inspect_err(|e| error!("Read error: {}", e))?;
    Ok(Json(messages))
}

/// LINE only looks at the status code, so failures carry no details.
async fn webhook(
    State(relay): State<Arc<Relay>>,
    Json(body): Json<WebhookBody>,
) -> (StatusCode, Json<Value>) {
    debug!(
        "Webhook for {} with {} events",
        body.destination.as_deref().unwrap_or("unknown destination"),
        body.events.len()
    );

    match relay.ingest(body.into_inbound()).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            error!("Webhook error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error" })),
            )
        }
    }
}

async fn send(
    State(relay): State<Arc<Relay>>,
    Json(request): Json<SendRequest>,
) -> Result<Json<Value>, RelayError> {
    relay
        .dispatch(&request.text)
        .await
        .inspect_err(|e| error!("Send error: {}", e))?;
    Ok(Json(json!({ "status": "ok" })))
}
