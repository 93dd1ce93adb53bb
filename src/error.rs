use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway is not configured with an upstream provider")]
    NotConfigured,

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream rejected the request and the retry ladder had nothing left to try.
    #[error("{message}")]
    Upstream { status: StatusCode, message: String },

    #[error("{0}")]
    Transport(String),

    #[error("Upstream stream went idle for {idle_secs}s before producing any content")]
    StreamTimeout { idle_secs: u64 },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream { status, .. } => {
                if status.is_client_error() || status.is_server_error() {
                    *status
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::StreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Anthropic `error.type` for this failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::NotConfigured => "service_unavailable",
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::NotFound(_) => "not_found_error",
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::Upstream { status, .. } => match *status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => "authentication_error",
                StatusCode::NOT_FOUND => "not_found_error",
                _ => "api_error",
            },
            GatewayError::Transport(_) | GatewayError::StreamTimeout { .. } => "api_error",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.error_type(), self.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.envelope())).into_response()
    }
}

/// `{ "type": "error", "error": { "type", "message" } }`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub envelope_type: &'static str,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn new(error_type: &str, message: String) -> Self {
        Self {
            envelope_type: "error",
            error: ErrorBody {
                error_type: error_type.to_string(),
                message,
            },
        }
    }
}

/// Pull the human-readable message out of an upstream error body.
///
/// Providers disagree on shape: `{"error":{"message"}}`, `{"message"}`,
/// `{"error":"..."}`, `{"error_description"}`, or plain text.
pub fn extract_upstream_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.get("message"),
            value.get("error_description"),
            value.get("error"),
            value.pointer("/0/error/message"),
        ];
        for candidate in candidates.into_iter().flatten() {
            if let Some(message) = candidate.as_str()
                && !message.trim().is_empty()
            {
                return message.to_string();
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        "Upstream returned an empty error body".to_string()
    } else {
        trimmed.to_string()
    }
}
