//! OpenAI Responses API adapter.
//!
//! The request is first built in Chat shape and then reshaped into the
//! Responses linear `input` list, so both OpenAI paths share one
//! Anthropic-to-OpenAI conversion.

use std::collections::HashSet;

use reqwest::header::HeaderMap;
use serde_json::Value;
use tracing::debug;

use super::{PreparedRequest, UpstreamBody};
use crate::anthropic::{AnthropicRequest, ThinkingConfig};
use crate::cache::ToolCallCache;
use crate::openai::{
    ChatCompletionRequest, ChatContentPart, ChatMessageContent, ResponseInputContentPart,
    ResponseInputItem, ResponseReasoning, ResponseTool, ResponsesRequest, ResponsesResponse,
};
use crate::transform::anthropic_to_openai;

/// Output recorded for a function call the client never answered.
const MISSING_TOOL_OUTPUT: &str = "Error: tool call was interrupted before a result was recorded.";

// ============================================================================
// Reasoning Effort Helpers (model suffix parsing)
// ============================================================================

/// Reasoning effort suffixes in order of specificity (longest first to avoid partial matches)
const REASONING_SUFFIXES: [&str; 5] = ["-xhigh", "-high", "-medium", "-low", "-none"];

/// Extract reasoning effort from model suffix (e.g., "gpt-5.1-codex-high" → Some("high"))
pub fn parse_reasoning_effort(model: &str) -> Option<&'static str> {
    REASONING_SUFFIXES
        .iter()
        .find(|suffix| model.ends_with(*suffix))
        .map(|suffix| &suffix[1..])
}

/// Strip reasoning suffix to get base model name for API call
/// (e.g., "gpt-5.1-codex-high" → "gpt-5.1-codex")
pub fn normalize_model_for_api(model: &str) -> &str {
    REASONING_SUFFIXES
        .iter()
        .find_map(|suffix| model.strip_suffix(suffix))
        .unwrap_or(model)
}

/// Model suffix wins; otherwise map the Anthropic thinking budget.
pub fn reasoning_effort(model: &str, thinking: Option<&ThinkingConfig>) -> Option<&'static str> {
    if let Some(effort) = parse_reasoning_effort(model) {
        return Some(effort);
    }
    match thinking {
        Some(ThinkingConfig::Enabled { budget_tokens }) => Some(match budget_tokens {
            Some(budget) if *budget >= 4096 => "high",
            Some(budget) if *budget >= 1024 => "medium",
            Some(_) => "low",
            None => "medium",
        }),
        _ => None,
    }
}

// ============================================================================
// Request
// ============================================================================

pub fn responses_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.ends_with("/responses") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/responses")
    }
}

pub fn prepare(
    base_url: &str,
    req: &AnthropicRequest,
    model: &str,
    cache: &ToolCallCache,
) -> PreparedRequest {
    let chat = anthropic_to_openai(req, normalize_model_for_api(model), cache);
    let effort = reasoning_effort(model, req.thinking.as_ref());
    PreparedRequest {
        candidate_urls: vec![responses_url(base_url)],
        body: UpstreamBody::Responses(chat_to_responses(chat, effort)),
        headers: HeaderMap::new(),
        stream: req.is_streaming(),
    }
}

/// Reshape a Chat Completions request into a Responses request.
pub fn chat_to_responses(chat: ChatCompletionRequest, effort: Option<&str>) -> ResponsesRequest {
    let mut instructions = Vec::new();
    let mut input = Vec::new();

    for message in chat.messages {
        match message.role.as_str() {
            "system" | "developer" => {
                if let Some(content) = &message.content {
                    instructions.push(content.to_text());
                }
            }
            "tool" => input.push(ResponseInputItem::FunctionCallOutput {
                call_id: message.tool_call_id.unwrap_or_default(),
                output: message.content.map(|c| c.to_text()).unwrap_or_default(),
            }),
            role => {
                if let Some(content) = message.content {
                    let parts = input_parts(content);
                    if !parts.is_empty() {
                        input.push(ResponseInputItem::Message {
                            role: role.to_string(),
                            content: parts,
                        });
                    }
                }
                for call in message.tool_calls.into_iter().flatten() {
                    input.push(ResponseInputItem::FunctionCall {
                        call_id: call.id,
                        name: call.function.name,
                        arguments: call.function.arguments,
                    });
                }
            }
        }
    }

    inject_missing_tool_outputs(&mut input);

    let tools = chat.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| ResponseTool {
                tool_type: "function".to_string(),
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool.function.parameters,
            })
            .collect()
    });

    let instructions: Vec<_> = instructions.into_iter().filter(|s| !s.is_empty()).collect();

    ResponsesRequest {
        model: chat.model,
        input,
        instructions: (!instructions.is_empty()).then(|| instructions.join("\n")),
        max_output_tokens: chat.max_tokens,
        temperature: chat.temperature,
        top_p: chat.top_p,
        stream: chat.stream,
        tools,
        tool_choice: chat.tool_choice.map(flatten_tool_choice),
        reasoning: effort.map(|effort| ResponseReasoning {
            effort: Some(effort.to_string()),
        }),
    }
}

// For Responses *input*, content parts should be `input_text` regardless of role.
// `output_text` is used in Responses *output* payloads, and can cause upstream validation errors.
fn input_parts(content: ChatMessageContent) -> Vec<ResponseInputContentPart> {
    match content {
        ChatMessageContent::Text(text) if text.is_empty() => Vec::new(),
        ChatMessageContent::Text(text) => vec![ResponseInputContentPart::InputText { text }],
        ChatMessageContent::Parts(parts) => parts
            .into_iter()
            .map(|part| match part {
                ChatContentPart::Text { text } => ResponseInputContentPart::InputText { text },
                ChatContentPart::ImageUrl { image_url } => ResponseInputContentPart::InputImage {
                    image_url: image_url.url,
                },
            })
            .collect(),
    }
}

/// `{type:function, function:{name}}` becomes `{type:function, name}`.
fn flatten_tool_choice(choice: Value) -> Value {
    match choice.pointer("/function/name").and_then(Value::as_str) {
        Some(name) => serde_json::json!({ "type": "function", "name": name }),
        None => choice,
    }
}

/// The Responses API rejects history with a `function_call` that has no
/// `function_call_output`; give each such call a synthetic error output
/// directly after it.
pub fn inject_missing_tool_outputs(input: &mut Vec<ResponseInputItem>) {
    let answered: HashSet<String> = input
        .iter()
        .filter_map(|item| match item {
            ResponseInputItem::FunctionCallOutput { call_id, .. } => Some(call_id.clone()),
            _ => None,
        })
        .collect();

    let mut i = 0;
    while i < input.len() {
        if let ResponseInputItem::FunctionCall { call_id, .. } = &input[i]
            && !answered.contains(call_id)
        {
            debug!(call_id = %call_id, "injecting output for unanswered function call");
            let output = ResponseInputItem::FunctionCallOutput {
                call_id: call_id.clone(),
                output: MISSING_TOOL_OUTPUT.to_string(),
            };
            input.insert(i + 1, output);
            i += 1;
        }
        i += 1;
    }
}

// ============================================================================
// Response
// ============================================================================

/// Some backends answer a non-stream request with SSE anyway; keep the final
/// `response` object from the `response.completed` (or `response.done`) event.
pub fn final_response_from_sse(body: &str) -> Option<ResponsesResponse> {
    let mut final_response = None;
    for line in body.lines() {
        let Some(data) = line.trim_end_matches('\r').strip_prefix("data:") else {
            continue;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
        if matches!(event_type, "response.completed" | "response.done")
            && let Some(response) = event.get("response")
        {
            final_response = serde_json::from_value(response.clone()).ok();
        }
    }
    final_response
}
