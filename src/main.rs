mod config;

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use anthropic_gateway::{Gateway, server};

use crate::config::{ENV_API_KEY, HostConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("anthropic_gateway=info")),
        )
        .init();

    let config = HostConfig::load()?;
    let gateway = Arc::new(Gateway::default());

    match config.upstream_config(std::env::var(ENV_API_KEY).ok()) {
        Some(upstream) => gateway.configure(upstream),
        None => warn!(
            path = %HostConfig::config_file_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "gateway.toml".to_string()),
            "no usable [upstream] table; serving 503 until configured"
        ),
    }

    info!(port = config.port, "starting anthropic gateway");
    server::start_server(gateway, config.port).await
}
