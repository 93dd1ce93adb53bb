//! Sends a prepared request upstream and walks the retry ladder.

use reqwest::header::{CONTENT_TYPE, HeaderValue};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::adapters::{self, PreparedRequest};
use crate::anthropic::AnthropicRequest;
use crate::cache::ToolCallCache;
use crate::error::{GatewayError, extract_upstream_message};
use crate::retry::{FailureContext, RetryAction, RetryFlags, classify};
use crate::upstream::{Credential, UpstreamConfig};

/// A 2xx upstream response together with the request that produced it.
#[derive(Debug)]
pub struct UpstreamReply {
    pub response: reqwest::Response,
    pub prepared: PreparedRequest,
    /// Deadline shared by the send and a non-stream body read.
    pub deadline: Instant,
}

impl UpstreamReply {
    /// Read the whole body before the request deadline.
    pub async fn text(self) -> Result<String, GatewayError> {
        match timeout_at(self.deadline, self.response.text()).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => Err(GatewayError::Transport(format!(
                "Failed to read upstream response: {e}"
            ))),
            Err(_) => Err(GatewayError::Transport(
                "Timed out reading upstream response".to_string(),
            )),
        }
    }
}

/// Send `req` to the configured upstream, retrying through the ladder until
/// it succeeds or no rule applies.
pub async fn dispatch(
    client: &reqwest::Client,
    config: &UpstreamConfig,
    req: &AnthropicRequest,
    cache: &ToolCallCache,
) -> Result<UpstreamReply, GatewayError> {
    let credential = config.credentials.resolve(false).await?;
    let prepared = adapters::prepare(config, req, cache, &credential);
    send_with_retries(client, config, credential, prepared).await
}

/// The retry loop proper. Each iteration sends once, and on failure applies
/// at most one ladder step before trying again.
pub async fn send_with_retries(
    client: &reqwest::Client,
    config: &UpstreamConfig,
    mut credential: Credential,
    mut prepared: PreparedRequest,
) -> Result<UpstreamReply, GatewayError> {
    let quirks = config.quirks();
    let mut flags = RetryFlags::default();
    let mut url_index = 0;

    loop {
        let url = prepared
            .candidate_urls
            .get(url_index)
            .ok_or_else(|| GatewayError::Transport("No upstream URL to try".to_string()))?;

        debug!(url = %url, mode = %config.endpoint_mode, "sending upstream request");
        let deadline = Instant::now() + config.request_timeout;
        let send = client
            .post(url)
            .bearer_auth(&credential.access_token)
            .header(CONTENT_TYPE, "application/json")
            .headers(prepared.headers.clone())
            .json(&prepared.body)
            .send();

        let response = match timeout_at(deadline, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let err = GatewayError::Transport(format!("Failed to connect to upstream: {e}"));
                warn!(url = %url, error = %err, "upstream request failed");
                return Err(err);
            }
            Err(_) => {
                let err = GatewayError::Transport(format!(
                    "Upstream did not respond within {}s",
                    config.request_timeout.as_secs()
                ));
                warn!(url = %url, error = %err, "upstream request timed out");
                return Err(err);
            }
        };

        let status = response.status();
        if status.is_success() {
            return Ok(UpstreamReply {
                response,
                prepared,
                deadline,
            });
        }

        let body = timeout_at(deadline, response.text())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();

        let action = classify(&FailureContext {
            status,
            body: &body,
            endpoint_mode: config.endpoint_mode,
            refreshable: config.credentials.is_refreshable(),
            has_next_url: url_index + 1 < prepared.candidate_urls.len(),
            quirks,
            flags,
        });

        match action {
            RetryAction::Surface => {
                let message = extract_upstream_message(&body);
                warn!(%status, url = %url, message = %message, "upstream rejected request");
                return Err(GatewayError::Upstream { status, message });
            }
            RetryAction::RefreshCredential => {
                credential = config.credentials.resolve(true).await?;
            }
            RetryAction::NextCandidateUrl => url_index += 1,
            RetryAction::ClampMaxTokens { min, max } => prepared.body.clamp_max_tokens(min, max),
            RetryAction::StrictSanitize => {
                prepared.body.strict_sanitize(quirks.single_system_message)
            }
            RetryAction::AddUserProjectHeader => {
                let project = prepared
                    .body
                    .project()
                    .or(credential.project_id.as_deref())
                    .unwrap_or_default();
                let value = HeaderValue::from_str(project).map_err(|e| {
                    GatewayError::Transport(format!("Invalid project id for header: {e}"))
                })?;
                prepared.headers.insert("x-goog-user-project", value);
            }
            RetryAction::DropThinkingLevel => prepared.body.drop_thinking_level(),
        }

        info!(%status, ?action, provider = %config.provider, "retrying upstream request");
        flags.record(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{CredentialResolver, Credentials, EndpointMode};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(max_tokens: f64) -> AnthropicRequest {
        serde_json::from_value(json!({
            "model": "claude-sonnet-4",
            "max_tokens": max_tokens,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    fn chat_config(server: &MockServer) -> UpstreamConfig {
        UpstreamConfig::new(
            format!("{}/v1", server.uri()),
            Credentials::ApiKey("sk-test".into()),
            "gpt-test",
            EndpointMode::OpenaiChat,
        )
    }

    #[tokio::test]
    async fn clamps_max_tokens_once_then_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"max_tokens": 8000})))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "max_tokens must be between 1 and 4096"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"max_tokens": 4096})))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"message": "max_tokens must be between 1 and 2048"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = dispatch(
            &reqwest::Client::new(),
            &chat_config(&server),
            &request(8000.0),
            &ToolCallCache::new(),
        )
        .await
        .unwrap_err();

        match err {
            GatewayError::Upstream { status, message } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(message, "max_tokens must be between 1 and 2048");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn sends_bearer_auth_and_returns_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"model": "gpt-test"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .expect(1)
            .mount(&server)
            .await;

        let reply = dispatch(
            &reqwest::Client::new(),
            &chat_config(&server),
            &request(100.0),
            &ToolCallCache::new(),
        )
        .await
        .unwrap();
        assert!(!reply.prepared.stream);
        assert!(reply.text().await.unwrap().contains("choices"));
    }

    #[tokio::test]
    async fn strict_trigger_sanitizes_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"temperature": 0.5})))
            .respond_with(
                ResponseTemplate::new(400).set_body_string("invalid params, invalid chat setting (2013)"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request(100.0);
        req.temperature = Some(0.5);
        let reply = dispatch(
            &reqwest::Client::new(),
            &chat_config(&server),
            &req,
            &ToolCallCache::new(),
        )
        .await
        .unwrap();

        let adapters::UpstreamBody::Chat(chat) = &reply.prepared.body else {
            panic!("expected chat body");
        };
        assert!(chat.temperature.is_none());
    }

    #[tokio::test]
    async fn not_found_falls_through_to_next_candidate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1beta/openai/chat/completions"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/openai/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .expect(1)
            .mount(&server)
            .await;

        let config = chat_config(&server);
        let credential = Credential {
            access_token: "sk-test".into(),
            project_id: None,
        };
        let mut prepared = adapters::prepare(
            &config,
            &request(100.0),
            &ToolCallCache::new(),
            &credential,
        );
        prepared.candidate_urls = vec![
            format!("{}/v1beta/openai/chat/completions", server.uri()),
            format!("{}/v1/openai/chat/completions", server.uri()),
        ];

        let reply = send_with_retries(&reqwest::Client::new(), &config, credential, prepared)
            .await
            .unwrap();
        assert!(reply.response.url().path().starts_with("/v1/openai"));
    }

    struct RotatingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CredentialResolver for RotatingResolver {
        async fn resolve(&self, force_refresh: bool) -> anyhow::Result<Credential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let token = if force_refresh { "fresh" } else { "stale" };
            Ok(Credential {
                access_token: token.into(),
                project_id: Some("proj-9".into()),
            })
        }
    }

    #[tokio::test]
    async fn refreshes_credential_once_on_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(401).set_body_string("still expired"))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = Arc::new(RotatingResolver {
            calls: AtomicUsize::new(0),
        });
        let config = UpstreamConfig::new(
            server.uri(),
            Credentials::Resolver(resolver.clone()),
            "gemini-3-pro-high",
            EndpointMode::CloudcodeSse,
        );

        let err = dispatch(
            &reqwest::Client::new(),
            &config,
            &request(100.0),
            &ToolCallCache::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
        assert!(
            matches!(err, GatewayError::Upstream { status, ref message } if status == StatusCode::UNAUTHORIZED && message == "still expired")
        );
    }

    #[tokio::test]
    async fn cloudcode_adds_user_project_then_drops_thinking_level() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .and(header("x-goog-user-project", "rising-fact-p41fc"))
            .and(body_partial_json(json!({
                "request": {"generationConfig": {"thinkingConfig": {"thinkingLevel": "HIGH"}}}
            })))
            .respond_with(
                ResponseTemplate::new(400).set_body_string("thinking_level is not supported"),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .and(header("x-goog-user-project", "rising-fact-p41fc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data: {}\n\n"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1internal:streamGenerateContent"))
            .respond_with(
                ResponseTemplate::new(403)
                    .set_body_string("Missing x-goog-user-project header"),
            )
            .expect(1)
            .mount(&server)
            .await;

        // A static key is not refreshable, so the 403 goes to the header rule.
        let config = UpstreamConfig::new(
            server.uri(),
            Credentials::ApiKey("tok".into()),
            "gemini-3-pro-high",
            EndpointMode::CloudcodeSse,
        );

        let reply = dispatch(
            &reqwest::Client::new(),
            &config,
            &request(100.0),
            &ToolCallCache::new(),
        )
        .await
        .unwrap();

        assert_eq!(reply.prepared.body.project(), Some("rising-fact-p41fc"));
        assert_eq!(
            reply.prepared.headers["x-goog-user-project"],
            "rising-fact-p41fc"
        );
    }
}
