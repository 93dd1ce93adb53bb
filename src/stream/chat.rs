//! OpenAI Chat Completions chunk decoder.

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::debug;

use super::{FrameDecoder, StreamEvent, StreamState};
use crate::cache::ToolCallCache;
use crate::error::{GatewayError, extract_upstream_message};
use crate::openai::ChatCompletionChunk;
use crate::transform::map_finish_reason;

pub struct ChatDecoder {
    state: StreamState,
    cache: Arc<ToolCallCache>,
    finish_reason: Option<String>,
}

impl ChatDecoder {
    pub fn new(model: &str, cache: Arc<ToolCallCache>) -> Self {
        Self {
            state: StreamState::new(model),
            cache,
            finish_reason: None,
        }
    }
}

impl FrameDecoder for ChatDecoder {
    fn data(&mut self, data: &str, out: &mut Vec<StreamEvent>) -> Result<(), GatewayError> {
        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(error = %e, "skipping malformed chat chunk");
                return Ok(());
            }
        };

        if let Some(error) = &chunk.error {
            return Err(GatewayError::Upstream {
                status: StatusCode::BAD_GATEWAY,
                message: extract_upstream_message(&serde_json::json!({ "error": error }).to_string()),
            });
        }

        for choice in &chunk.choices {
            let delta = &choice.delta;
            if let Some(reasoning) = delta
                .reasoning_content
                .as_deref()
                .or(delta.reasoning.as_deref())
            {
                self.state.thinking(reasoning, out);
            }
            if let Some(content) = delta.content.as_deref() {
                self.state.text(content, out);
            }

            for (position, call) in delta.tool_calls.iter().flatten().enumerate() {
                let key = call.index.unwrap_or(position as u32);
                let function = call.function.as_ref();
                self.state.tool_delta(
                    key,
                    call.id.as_deref(),
                    function.and_then(|f| f.name.as_deref()),
                    function.and_then(|f| f.arguments.as_deref()),
                    out,
                );
                if let Some(extra) = &call.extra_content
                    && let Some(id) = self.state.tool_id(key)
                {
                    self.cache.insert(id, extra.clone());
                }
            }

            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }

        if let Some(usage) = chunk.usage {
            self.state
                .set_usage(Some(usage.prompt_tokens), Some(usage.completion_tokens));
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<StreamEvent>) {
        if self.state.is_finished() {
            return;
        }
        let reason = map_finish_reason(self.finish_reason.as_deref(), self.state.saw_tool_use());
        self.state.set_stop_reason(reason);
        self.state.finish(out);
    }

    fn state(&self) -> &StreamState {
        &self.state
    }
}
