//! Request builders, one per upstream kind.
//!
//! Each adapter turns an Anthropic request into a `PreparedRequest`: the
//! candidate URLs to try in order, a typed body the retry ladder can still
//! mutate, and any extra headers the upstream insists on.

pub mod cloudcode;
pub mod openai_chat;
pub mod responses;

use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::anthropic::AnthropicRequest;
use crate::cache::ToolCallCache;
use crate::openai::{ChatCompletionRequest, ChatMessage, ChatMessageContent, ResponsesRequest};
use crate::retry::STRICT_MAX_TOKENS;
use crate::schema::{SchemaProfile, clean_json_schema};
use crate::upstream::{Credential, EndpointMode, UpstreamConfig};

pub use cloudcode::CloudCodeRequest;

#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub candidate_urls: Vec<String>,
    pub body: UpstreamBody,
    pub headers: HeaderMap,
    /// Whether the upstream answers with SSE.
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum UpstreamBody {
    Chat(ChatCompletionRequest),
    Responses(ResponsesRequest),
    CloudCode(Box<CloudCodeRequest>),
}

/// Build the upstream request for whichever endpoint mode is configured.
pub fn prepare(
    config: &UpstreamConfig,
    req: &AnthropicRequest,
    cache: &ToolCallCache,
    credential: &Credential,
) -> PreparedRequest {
    let model = config.resolve_model(&req.model);
    match config.endpoint_mode {
        EndpointMode::OpenaiChat => openai_chat::prepare(&config.base_url, req, model, cache),
        EndpointMode::OpenaiResponses => responses::prepare(&config.base_url, req, model, cache),
        EndpointMode::CloudcodeSse => cloudcode::prepare(
            &config.base_url,
            req,
            model,
            cache,
            credential.project_id.as_deref(),
        ),
    }
}

impl UpstreamBody {
    pub fn max_tokens(&self) -> Option<u32> {
        match self {
            UpstreamBody::Chat(chat) => chat.max_tokens,
            UpstreamBody::Responses(resp) => resp.max_output_tokens,
            UpstreamBody::CloudCode(cc) => cc.request.generation_config.max_output_tokens,
        }
    }

    fn max_tokens_mut(&mut self) -> &mut Option<u32> {
        match self {
            UpstreamBody::Chat(chat) => &mut chat.max_tokens,
            UpstreamBody::Responses(resp) => &mut resp.max_output_tokens,
            UpstreamBody::CloudCode(cc) => &mut cc.request.generation_config.max_output_tokens,
        }
    }

    /// Pull `max_tokens` into `[min, max]`; an unset value becomes `max`.
    pub fn clamp_max_tokens(&mut self, min: u32, max: u32) {
        let slot = self.max_tokens_mut();
        *slot = Some(slot.unwrap_or(max).clamp(min, max));
    }

    /// Reduce the body to what the pickiest OpenAI-compatible providers accept.
    pub fn strict_sanitize(&mut self, single_system_message: bool) {
        if let Some(max) = self.max_tokens_mut() {
            *max = (*max).clamp(1, STRICT_MAX_TOKENS);
        }
        match self {
            UpstreamBody::Chat(chat) => {
                chat.temperature = None;
                chat.top_p = None;
                chat.stop = None;
                chat.tool_choice = None;
                for tool in chat.tools.iter_mut().flatten() {
                    if let Some(params) = &tool.function.parameters {
                        tool.function.parameters =
                            Some(clean_json_schema(params, SchemaProfile::Strict));
                    }
                }
                for message in &mut chat.messages {
                    if matches!(message.content, Some(ChatMessageContent::Parts(_))) {
                        message.content = message
                            .content
                            .take()
                            .map(|c| ChatMessageContent::Text(c.to_text()));
                    }
                }
                if single_system_message {
                    merge_system_messages(&mut chat.messages);
                }
            }
            UpstreamBody::Responses(resp) => {
                resp.temperature = None;
                resp.top_p = None;
                resp.tool_choice = None;
                for tool in resp.tools.iter_mut().flatten() {
                    if let Some(params) = &tool.parameters {
                        tool.parameters = Some(clean_json_schema(params, SchemaProfile::Strict));
                    }
                }
            }
            UpstreamBody::CloudCode(_) => {}
        }
    }

    pub fn drop_thinking_level(&mut self) {
        if let UpstreamBody::CloudCode(cc) = self
            && let Some(thinking) = cc.request.generation_config.thinking_config.as_mut()
        {
            thinking.thinking_level = None;
        }
    }

    /// Cloud Code project the request is billed to.
    pub fn project(&self) -> Option<&str> {
        match self {
            UpstreamBody::CloudCode(cc) => Some(cc.project.as_str()),
            _ => None,
        }
    }
}

/// Collapse every system message into one leading system message.
fn merge_system_messages(messages: &mut Vec<ChatMessage>) {
    let mut system_text = Vec::new();
    messages.retain(|m| {
        if m.role == "system" {
            if let Some(content) = &m.content {
                system_text.push(content.to_text());
            }
            false
        } else {
            true
        }
    });
    let merged: Vec<_> = system_text.into_iter().filter(|t| !t.is_empty()).collect();
    if !merged.is_empty() {
        messages.insert(0, ChatMessage::text("system", merged.join("\n\n")));
    }
}
