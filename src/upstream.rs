//! Upstream provider configuration.
//!
//! A `UpstreamConfig` is built by the host and handed to the gateway whole;
//! the gateway never reads settings or credentials from disk itself.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::retry::{ProviderQuirks, quirks_for};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Which family of wire protocol the upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Openai,
    Antigravity,
}

/// Which adapter builds the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointMode {
    #[serde(rename = "openai-chat")]
    OpenaiChat,
    #[serde(rename = "openai-responses")]
    OpenaiResponses,
    #[serde(rename = "cloudcode-sse")]
    CloudcodeSse,
}

impl EndpointMode {
    pub fn upstream_kind(self) -> UpstreamKind {
        match self {
            EndpointMode::OpenaiChat | EndpointMode::OpenaiResponses => UpstreamKind::Openai,
            EndpointMode::CloudcodeSse => UpstreamKind::Antigravity,
        }
    }
}

impl fmt::Display for EndpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointMode::OpenaiChat => write!(f, "openai-chat"),
            EndpointMode::OpenaiResponses => write!(f, "openai-responses"),
            EndpointMode::CloudcodeSse => write!(f, "cloudcode-sse"),
        }
    }
}

/// A bearer token plus, for Cloud Code, the project it is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub project_id: Option<String>,
}

/// Supplies OAuth-style credentials. `force_refresh` asks the resolver to
/// skip any cached token, and is used once after a 401/403.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, force_refresh: bool) -> anyhow::Result<Credential>;
}

#[derive(Clone)]
pub enum Credentials {
    ApiKey(String),
    Resolver(Arc<dyn CredentialResolver>),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
            Credentials::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

impl Credentials {
    /// Only resolver-backed credentials can be refreshed.
    pub fn is_refreshable(&self) -> bool {
        matches!(self, Credentials::Resolver(_))
    }

    pub async fn resolve(&self, force_refresh: bool) -> Result<Credential, GatewayError> {
        match self {
            Credentials::ApiKey(key) => Ok(Credential {
                access_token: key.clone(),
                project_id: None,
            }),
            Credentials::Resolver(resolver) => resolver
                .resolve(force_refresh)
                .await
                .map_err(|e| GatewayError::Authentication(format!("{e:#}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub credentials: Credentials,
    /// Upstream model used when the client asks for anything not in `model_aliases`.
    pub model: String,
    /// Extra upstream model ids a client may select by name.
    pub model_aliases: Vec<String>,
    pub provider: String,
    pub upstream_kind: UpstreamKind,
    pub endpoint_mode: EndpointMode,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

impl UpstreamConfig {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Credentials,
        model: impl Into<String>,
        endpoint_mode: EndpointMode,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            credentials,
            model: model.into(),
            model_aliases: Vec::new(),
            provider: String::new(),
            upstream_kind: endpoint_mode.upstream_kind(),
            endpoint_mode,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_model_aliases(mut self, aliases: Vec<String>) -> Self {
        self.model_aliases = aliases;
        self
    }

    pub fn with_timeouts(mut self, request_timeout: Duration, idle_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self.idle_timeout = idle_timeout;
        self
    }

    /// The upstream model id for a client-requested model name.
    pub fn resolve_model<'a>(&'a self, requested: &'a str) -> &'a str {
        if self.model_aliases.iter().any(|alias| alias == requested) {
            requested
        } else {
            &self.model
        }
    }

    /// Configured model first, then aliases, without duplicates.
    pub fn model_ids(&self) -> Vec<&str> {
        let mut ids = vec![self.model.as_str()];
        for alias in &self.model_aliases {
            if !ids.contains(&alias.as_str()) {
                ids.push(alias);
            }
        }
        ids
    }

    pub fn quirks(&self) -> &'static ProviderQuirks {
        quirks_for(&self.provider, &self.base_url)
    }

    /// Inactivity limit between upstream stream reads.
    pub fn stream_idle_timeout(&self) -> Duration {
        match self.endpoint_mode {
            EndpointMode::CloudcodeSse => self.idle_timeout,
            EndpointMode::OpenaiChat | EndpointMode::OpenaiResponses => self.request_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RevokedRefreshResolver;

    #[async_trait]
    impl CredentialResolver for RevokedRefreshResolver {
        async fn resolve(&self, force_refresh: bool) -> anyhow::Result<Credential> {
            if force_refresh {
                anyhow::bail!("refresh token revoked");
            }
            Ok(Credential {
                access_token: "tok".into(),
                project_id: Some("proj".into()),
            })
        }
    }

    #[test]
    fn endpoint_mode_round_trips_kebab_names() {
        let mode: EndpointMode = serde_json::from_str("\"openai-responses\"").unwrap();
        assert_eq!(mode, EndpointMode::OpenaiResponses);
        assert_eq!(EndpointMode::CloudcodeSse.to_string(), "cloudcode-sse");
        assert_eq!(
            EndpointMode::CloudcodeSse.upstream_kind(),
            UpstreamKind::Antigravity
        );
    }

    #[test]
    fn resolve_model_honours_aliases() {
        let config = UpstreamConfig::new(
            "https://api.example.com/v1",
            Credentials::ApiKey("k".into()),
            "gpt-main",
            EndpointMode::OpenaiChat,
        )
        .with_model_aliases(vec!["gpt-mini".into(), "gpt-main".into()]);

        assert_eq!(config.resolve_model("claude-sonnet-4"), "gpt-main");
        assert_eq!(config.resolve_model("gpt-mini"), "gpt-mini");
        assert_eq!(config.model_ids(), vec!["gpt-main", "gpt-mini"]);
    }

    #[tokio::test]
    async fn resolver_failures_become_authentication_errors() {
        let creds = Credentials::Resolver(Arc::new(RevokedRefreshResolver));
        assert!(creds.is_refreshable());
        assert_eq!(creds.resolve(false).await.unwrap().access_token, "tok");

        let err = creds.resolve(true).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(ref m) if m.contains("revoked")));
        assert!(!Credentials::ApiKey("k".into()).is_refreshable());
    }
}
