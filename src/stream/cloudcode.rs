//! Cloud Code Assist SSE frame decoder.

use std::sync::Arc;

use tracing::debug;

use super::{FrameDecoder, StreamEvent, StreamState};
use crate::adapters::cloudcode::{CloudCodeFrame, Part};
use crate::anthropic::new_tool_use_id;
use crate::cache::{ToolCallCache, thought_signature_extra};
use crate::error::GatewayError;

pub struct CloudCodeDecoder {
    state: StreamState,
    cache: Arc<ToolCallCache>,
    finish_reason: Option<String>,
}

impl CloudCodeDecoder {
    pub fn new(model: &str, cache: Arc<ToolCallCache>) -> Self {
        Self {
            state: StreamState::new(model),
            cache,
            finish_reason: None,
        }
    }

    fn part(&mut self, part: Part, out: &mut Vec<StreamEvent>) {
        if let Some(call) = part.function_call {
            let id = call
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(new_tool_use_id);
            if let Some(signature) = part.thought_signature.or(call.thought_signature) {
                self.cache.insert(&id, thought_signature_extra(&signature));
            }
            self.state.tool_call(&id, &call.name, &call.args, out);
            return;
        }

        let thought = part.thought.unwrap_or(false);
        if let Some(text) = part.text.as_deref() {
            if thought {
                self.state.thinking(text, out);
            } else {
                self.state.text(text, out);
            }
        }
        if thought && let Some(signature) = part.thought_signature.as_deref() {
            self.state.thinking_signature(signature, out);
        }
    }
}

/// Gemini `finishReason` to Anthropic `stop_reason`.
fn map_finish_reason(reason: Option<&str>, has_tool_calls: bool) -> &'static str {
    if has_tool_calls {
        return "tool_use";
    }
    match reason {
        Some("MAX_TOKENS") => "max_tokens",
        _ => "end_turn",
    }
}

impl FrameDecoder for CloudCodeDecoder {
    fn data(&mut self, data: &str, out: &mut Vec<StreamEvent>) -> Result<(), GatewayError> {
        let frame: CloudCodeFrame = match serde_json::from_str(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "skipping malformed cloud code frame");
                return Ok(());
            }
        };
        let response = frame.into_response();

        if let Some(usage) = response.usage_metadata {
            self.state.set_usage(
                Some(usage.prompt_token_count),
                Some(usage.candidates_token_count + usage.thoughts_token_count),
            );
        }

        if let Some(candidate) = response.candidates.into_iter().next() {
            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                self.part(part, out);
            }
            if candidate.finish_reason.is_some() {
                self.finish_reason = candidate.finish_reason;
            }
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
