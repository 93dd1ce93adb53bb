//! The shared gateway: current upstream, tool-call cache, last error.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapters::responses::final_response_from_sse;
use crate::anthropic::{AnthropicRequest, AnthropicResponse};
use crate::cache::ToolCallCache;
use crate::dispatcher::dispatch;
use crate::error::GatewayError;
use crate::openai::{ChatCompletionResponse, ResponsesResponse};
use crate::stream::{self, EventResult, StreamEvent};
use crate::transform::{openai_to_anthropic, responses_to_anthropic};
use crate::upstream::{EndpointMode, UpstreamConfig};

/// What `/v1/messages` answers with.
pub enum MessagesReply {
    Json(AnthropicResponse),
    Stream(EventStream),
}

/// A started event stream: the first event has already arrived.
pub struct EventStream {
    pub first: StreamEvent,
    pub rest: mpsc::Receiver<EventResult>,
}

impl EventStream {
    /// SSE text chunks. An upstream error after the first event becomes an
    /// `error` event and ends the stream.
    pub fn into_sse(self) -> impl futures::Stream<Item = String> + Send + 'static {
        let EventStream { first, mut rest } = self;
        async_stream::stream! {
            yield first.to_sse();
            while let Some(item) = rest.recv().await {
                match item {
                    Ok(event) => yield event.to_sse(),
                    Err(err) => {
                        yield StreamEvent::error(&err).to_sse();
                        break;
                    }
                }
            }
        }
    }
}

/// Snapshot for `/healthz`.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub configured: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub last_error: Option<String>,
}

pub struct Gateway {
    client: reqwest::Client,
    config: RwLock<Option<Arc<UpstreamConfig>>>,
    cache: Arc<ToolCallCache>,
    last_error: Mutex<Option<String>>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl Gateway {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            config: RwLock::new(None),
            cache: Arc::new(ToolCallCache::new()),
            last_error: Mutex::new(None),
        }
    }

    /// Replace the upstream wholesale. In-flight requests keep the snapshot
    /// they started with.
    pub fn configure(&self, config: UpstreamConfig) {
        info!(
            provider = %config.provider,
            model = %config.model,
            mode = %config.endpoint_mode,
            "gateway configured"
        );
        *self.config.write() = Some(Arc::new(config));
        *self.last_error.lock() = None;
    }

    /// Drop the upstream and forget everything learned from it.
    pub fn reset(&self) {
        *self.config.write() = None;
        *self.last_error.lock() = None;
        self.cache.clear();
        info!("gateway reset");
    }

    pub fn snapshot(&self) -> Option<Arc<UpstreamConfig>> {
        self.config.read().clone()
    }

    pub fn cache(&self) -> &Arc<ToolCallCache> {
        &self.cache
    }

    pub fn status(&self) -> GatewayStatus {
        let config = self.snapshot();
        GatewayStatus {
            configured: config.is_some(),
            provider: config.as_ref().map(|c| c.provider.clone()),
            model: config.as_ref().map(|c| c.model.clone()),
            last_error: self.last_error.lock().clone(),
        }
    }

    fn record(&self, result: &Result<MessagesReply, GatewayError>) {
        let mut last_error = self.last_error.lock();
        match result {
            Ok(_) => *last_error = None,
            Err(err) => *last_error = Some(err.to_string()),
        }
    }

    pub async fn messages(&self, req: AnthropicRequest) -> Result<MessagesReply, GatewayError> {
        let config = self.snapshot().ok_or(GatewayError::NotConfigured)?;
        let result = self.forward(&config, &req).await;
        self.record(&result);
        result
    }

    async fn forward(
        &self,
        config: &UpstreamConfig,
        req: &AnthropicRequest,
    ) -> Result<MessagesReply, GatewayError> {
        let reply = dispatch(&self.client, config, req, &self.cache).await?;

        if reply.prepared.stream {
            let decoder = stream::decoder_for(config.endpoint_mode, &req.model, self.cache.clone());
            let mut rx = stream::spawn_producer(
                reply.response.bytes_stream(),
                decoder,
                config.stream_idle_timeout(),
            );

            if !req.is_streaming() {
                return stream::collect(rx).await.map(MessagesReply::Json);
            }
            return match rx.recv().await {
                Some(Ok(first)) => Ok(MessagesReply::Stream(EventStream { first, rest: rx })),
                Some(Err(err)) => Err(err),
                None => Err(GatewayError::Transport(
                    "Upstream stream ended before any event".to_string(),
                )),
            };
        }

        let mode = config.endpoint_mode;
        let body = reply.text().await?;
        parse_one_shot(mode, &body, &req.model, &self.cache).map(MessagesReply::Json)
    }
}

fn parse_one_shot(
    mode: EndpointMode,
    body: &str,
    model: &str,
    cache: &ToolCallCache,
) -> Result<AnthropicResponse, GatewayError> {
    let invalid = |e: serde_json::Error| {
        warn!(error = %e, "upstream returned an unparsable body");
        GatewayError::Transport(format!("Invalid upstream response: {e}"))
    };
    match mode {
        EndpointMode::OpenaiChat => {
            let resp: ChatCompletionResponse = serde_json::from_str(body).map_err(invalid)?;
            Ok(openai_to_anthropic(&resp, model, cache))
        }
        EndpointMode::OpenaiResponses => {
            let trimmed = body.trim_start();
            let resp: ResponsesResponse =
                if trimmed.starts_with("event:") || trimmed.starts_with("data:") {
                    final_response_from_sse(body).ok_or_else(|| {
                        GatewayError::Transport(
                            "Upstream SSE carried no completed response".to_string(),
                        )
                    })?
                } else {
                    serde_json::from_str(body).map_err(invalid)?
                };
            Ok(responses_to_anthropic(&resp, model))
        }
        // Cloud Code only streams; non-stream requests are folded from events.
        EndpointMode::CloudcodeSse => Err(GatewayError::Transport(
            "Cloud Code returned a non-stream response".to_string(),
        )),
    }
}
