//! Loopback HTTP front door speaking the Anthropic Messages API.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::anthropic::AnthropicRequest;
use crate::error::GatewayError;
use crate::gateway::{Gateway, MessagesReply};
use crate::transform::count_input_tokens;

pub const DEFAULT_PORT: u16 = 4000;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/v1/messages", post(messages_handler))
        .route("/anthropic/v1/messages", post(messages_handler))
        .route("/v1/messages/count_tokens", post(count_tokens_handler))
        .route("/v1/models", get(models_handler))
        .route("/v1/models/{id}", get(model_handler))
        .fallback(fallback_handler)
        .with_state(gateway)
}

pub async fn start_server(gateway: Arc<Gateway>, port: u16) -> Result<()> {
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "anthropic gateway listening");

    axum::serve(listener, router(gateway))
        .await
        .context("Gateway server stopped unexpectedly")?;

    Ok(())
}

fn sse_response(stream: impl Stream<Item = String> + Send + 'static) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream.map(Ok::<_, Infallible>)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, GatewayError> {
    serde_json::from_slice(body).map_err(|e| GatewayError::InvalidRequest(e.to_string()))
}

async fn messages_handler(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    let req: AnthropicRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(err) => return err.into_response(),
    };
    debug!(model = %req.model, stream = req.is_streaming(), "messages request");

    match gateway.messages(req).await {
        Ok(MessagesReply::Json(resp)) => Json(resp).into_response(),
        Ok(MessagesReply::Stream(events)) => sse_response(events.into_sse()),
        Err(err) => err.into_response(),
    }
}

async fn count_tokens_handler(body: Bytes) -> Response {
    match parse_body::<Value>(&body) {
        Ok(value) => Json(json!({ "input_tokens": count_input_tokens(&value) })).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    #[serde(rename = "type")]
    object_type: &'static str,
    id: String,
    display_name: String,
    created_at: &'static str,
}

impl ModelInfo {
    fn new(id: &str) -> Self {
        Self {
            object_type: "model",
            id: id.to_string(),
            display_name: id.to_string(),
            created_at: "1970-01-01T00:00:00Z",
        }
    }
}

async fn models_handler(State(gateway): State<Arc<Gateway>>) -> Response {
    let Some(config) = gateway.snapshot() else {
        return GatewayError::NotConfigured.into_response();
    };
    let data: Vec<ModelInfo> = config.model_ids().into_iter().map(ModelInfo::new).collect();
    Json(json!({
        "data": data,
        "has_more": false,
        "first_id": data.first().map(|m| m.id.clone()),
        "last_id": data.last().map(|m| m.id.clone()),
    }))
    .into_response()
}

async fn model_handler(State(gateway): State<Arc<Gateway>>, Path(id): Path<String>) -> Response {
    let Some(config) = gateway.snapshot() else {
        return GatewayError::NotConfigured.into_response();
    };
    if config.model_ids().contains(&id.as_str()) {
        Json(ModelInfo::new(&id)).into_response()
    } else {
        GatewayError::NotFound(format!("model: {id}")).into_response()
    }
}

async fn health_handler(State(gateway): State<Arc<Gateway>>) -> Response {
    let status = gateway.status();
    Json(json!({
        "status": "ok",
        "configured": status.configured,
        "provider": status.provider,
        "model": status.model,
        "last_error": status.last_error,
    }))
    .into_response()
}

async fn fallback_handler(req: Request) -> Response {
    let path = req.uri().path();

    // Telemetry the client sends on its own; accept and drop it.
    if path.contains("event_logging") {
        return StatusCode::OK.into_response();
    }

    GatewayError::NotFound(format!("Not found: {path}")).into_response()
}
