use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anthropic_gateway::server::DEFAULT_PORT;
use anthropic_gateway::upstream::{
    Credentials, DEFAULT_IDLE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, EndpointMode, UpstreamConfig,
    UpstreamKind,
};

pub const ENV_API_KEY: &str = "GATEWAY_API_KEY";

const DEFAULT_CONFIG: &str = r#"# anthropic-gateway configuration
port = 4000

# Uncomment and fill in to start configured. Without an [upstream] table the
# gateway answers 503 until one is added.
#
# [upstream]
# base_url = "https://api.z.ai/api/coding/paas/v4"
# api_key = "YOUR_API_KEY_HERE"          # or set GATEWAY_API_KEY
# model = "glm-4.7"
# provider = "zai"
# endpoint_mode = "openai-chat"          # openai-chat | openai-responses | cloudcode-sse
# model_aliases = ["glm-4.5-air"]
# request_timeout_secs = 120
# idle_timeout_secs = 15
"#;

/// The `[upstream]` table.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpstreamSection {
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub provider: String,

    /// Used to pick an endpoint mode when `endpoint_mode` is absent.
    #[serde(default)]
    pub upstream_kind: Option<UpstreamKind>,

    #[serde(default)]
    pub endpoint_mode: Option<EndpointMode>,

    #[serde(default)]
    pub model_aliases: Vec<String>,

    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl UpstreamSection {
    pub fn endpoint_mode(&self) -> EndpointMode {
        match (self.endpoint_mode, self.upstream_kind) {
            (Some(mode), _) => mode,
            (None, Some(UpstreamKind::Antigravity)) => EndpointMode::CloudcodeSse,
            (None, _) => EndpointMode::OpenaiChat,
        }
    }
}

/// Root configuration file structure
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub upstream: Option<UpstreamSection>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            upstream: None,
        }
    }
}

impl HostConfig {
    /// ~/.config/anthropic-gateway on Linux, ~/Library/Application Support on macOS
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("anthropic-gateway"))
    }

    pub fn config_file_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("gateway.toml"))
    }

    /// Load config from disk, writing the commented default if none exists
    pub fn load() -> Result<Self> {
        let config_path =
            Self::config_file_path().context("Could not determine config directory")?;

        if !config_path.exists() {
            write_default(&config_path)?;
        }

        let contents = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// The upstream to configure the gateway with, if the file names a usable one.
    /// `env_key` wins over the file's `api_key`.
    pub fn upstream_config(&self, env_key: Option<String>) -> Option<UpstreamConfig> {
        let section = self.upstream.as_ref()?;
        let api_key = env_key
            .filter(|k| !k.is_empty())
            .or_else(|| section.api_key.clone())
            .filter(|k| !k.is_empty())?;
        if section.model.is_empty() {
            return None;
        }

        let request_timeout = section
            .request_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let idle_timeout = section
            .idle_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);

        Some(
            UpstreamConfig::new(
                section.base_url.trim_end_matches('/'),
                Credentials::ApiKey(api_key),
                section.model.clone(),
                section.endpoint_mode(),
            )
            .with_provider(section.provider.clone())
            .with_model_aliases(section.model_aliases.clone())
            .with_timeouts(request_timeout, idle_timeout),
        )
    }
}

fn write_default(config_path: &std::path::Path) -> Result<()> {
    let config_dir = HostConfig::config_dir().context("Could not determine config directory")?;

    fs::create_dir_all(&config_dir).with_context(|| {
        format!(
            "Failed to create config directory: {}",
            config_dir.display()
        )
    })?;

    fs::write(config_path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

    Ok(())
}
