//! Antigravity Cloud Code Assist adapter.
//!
//! Cloud Code wraps a Gemini `generateContent` body in an envelope carrying
//! the project, model and request id, and only offers a streaming endpoint.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{PreparedRequest, UpstreamBody};
use crate::anthropic::{AnthropicRequest, ContentBlock};
use crate::cache::ToolCallCache;
use crate::schema::{SchemaProfile, tool_parameters};
use crate::transform::{valid_max_tokens, valid_temperature, valid_top_p};

pub const DEFAULT_CLOUDCODE_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";
pub const DEFAULT_PROJECT_ID: &str = "rising-fact-p41fc";
const STREAM_PATH: &str = "/v1internal:streamGenerateContent?alt=sse";

const ANTIGRAVITY_USER_AGENT: &str = "antigravity/1.18.3 darwin/arm64";
const API_CLIENT_HEADER: &str = "google-cloud-sdk vscode_cloudshelleditor/0.1";
const CLIENT_METADATA: &str =
    r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#;

const SYSTEM_PREAMBLE: &str = "You are Antigravity, a powerful agentic AI coding assistant designed by the Google Deepmind team working on Advanced Agentic Coding.";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudCodeRequest {
    pub project: String,
    pub model: String,
    pub request: GenerateContentRequest,
    pub request_type: String,
    pub user_agent: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_thought(&self) -> bool {
        self.thought.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Some models put the signature on the call instead of the part.
    #[serde(default, skip_serializing)]
    pub thought_signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub include_thoughts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCallingConfig {
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_function_names: Option<Vec<String>>,
}

// ---- streamed response frames ----

/// One `data:` frame. Cloud Code wraps the Gemini response in `response`;
/// the bare shape is accepted too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CloudCodeFrame {
    Wrapped { response: GenerateContentResponse },
    Bare(GenerateContentResponse),
}

impl CloudCodeFrame {
    pub fn into_response(self) -> GenerateContentResponse {
        match self {
            CloudCodeFrame::Wrapped { response } | CloudCodeFrame::Bare(response) => response,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub thoughts_token_count: u32,
}

// ============================================================================
// Request building
// ============================================================================

pub fn stream_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    if trimmed.is_empty() {
        format!("{DEFAULT_CLOUDCODE_BASE_URL}{STREAM_PATH}")
    } else if trimmed.contains("/v1internal:") {
        trimmed.to_string()
    } else {
        format!("{trimmed}{STREAM_PATH}")
    }
}

/// `pro-high → HIGH`, `pro-low`/`flash → LOW`, anything `thinking → MEDIUM`.
pub fn thinking_level_for(model: &str) -> Option<&'static str> {
    let model = model.to_ascii_lowercase();
    if model.contains("pro-high") {
        Some("HIGH")
    } else if model.contains("pro-low") || model.contains("flash") {
        Some("LOW")
    } else if model.contains("thinking") {
        Some("MEDIUM")
    } else {
        None
    }
}

/// Cloud Code rejects malformed signatures outright, so only forward ones
/// that are well-formed standard base64.
pub fn is_valid_thought_signature(signature: &str) -> bool {
    !signature.is_empty()
        && signature.len() % 4 == 0
        && base64::engine::general_purpose::STANDARD
            .decode(signature)
            .is_ok()
}

fn antigravity_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
    headers.insert(USER_AGENT, HeaderValue::from_static(ANTIGRAVITY_USER_AGENT));
    headers.insert(
        "x-goog-api-client",
        HeaderValue::from_static(API_CLIENT_HEADER),
    );
    headers.insert("client-metadata", HeaderValue::from_static(CLIENT_METADATA));
    headers
}

pub fn prepare(
    base_url: &str,
    req: &AnthropicRequest,
    model: &str,
    cache: &ToolCallCache,
    project_id: Option<&str>,
) -> PreparedRequest {
    let body = CloudCodeRequest {
        project: project_id.unwrap_or(DEFAULT_PROJECT_ID).to_string(),
        model: model.to_string(),
        request: build_generate_request(req, model, cache),
        request_type: "agent".to_string(),
        user_agent: "antigravity".to_string(),
        request_id: new_request_id(),
    };
    PreparedRequest {
        candidate_urls: vec![stream_url(base_url)],
        body: UpstreamBody::CloudCode(Box::new(body)),
        headers: antigravity_headers(),
        stream: true,
    }
}

fn new_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("agent-{}-{}", millis, uuid::Uuid::new_v4().simple())
}

pub fn build_generate_request(
    req: &AnthropicRequest,
    model: &str,
    cache: &ToolCallCache,
) -> GenerateContentRequest {
    let mut system_parts = vec![Part::text(SYSTEM_PREAMBLE)];
    if let Some(system) = &req.system {
        system_parts.extend(system.segments().into_iter().map(Part::text));
    }

    let tools: Vec<FunctionDeclaration> = req
        .function_tools()
        .map(|tool| FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool_parameters(tool.input_schema.as_ref(), SchemaProfile::Strict),
        })
        .collect();
    let tool_config = if tools.is_empty() {
        None
    } else {
        req.tool_choice.as_ref().and_then(map_tool_choice)
    };

    GenerateContentRequest {
        contents: convert_messages(req, cache),
        system_instruction: Some(Content {
            role: "user".to_string(),
            parts: system_parts,
        }),
        generation_config: GenerationConfig {
            max_output_tokens: valid_max_tokens(req.max_tokens),
            temperature: valid_temperature(req.temperature),
            top_p: valid_top_p(req.top_p),
            top_k: req.top_k,
            stop_sequences: req.stop_sequences.clone().filter(|s| !s.is_empty()),
            thinking_config: Some(ThinkingConfig {
                include_thoughts: true,
                thinking_level: thinking_level_for(model).map(str::to_string),
            }),
        },
        tools: (!tools.is_empty()).then(|| {
            vec![Tool {
                function_declarations: tools,
            }]
        }),
        tool_config,
    }
}

fn map_tool_choice(choice: &Value) -> Option<ToolConfig> {
    let kind = choice
        .as_str()
        .or_else(|| choice.get("type").and_then(Value::as_str))?
        .to_ascii_lowercase();
    let (mode, allowed) = match kind.as_str() {
        "auto" => ("AUTO", None),
        "none" => ("NONE", None),
        "any" | "required" => ("ANY", None),
        "tool" => {
            let name = choice.get("name").and_then(Value::as_str)?;
            ("ANY", Some(vec![name.to_string()]))
        }
        _ => return None,
    };
    Some(ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode: mode.to_string(),
            allowed_function_names: allowed,
        },
    })
}

/// Gemini roles: assistant turns are `model`, everything else (including
/// tool results) is `user`. Consecutive turns with the same role are merged.
fn convert_messages(req: &AnthropicRequest, cache: &ToolCallCache) -> Vec<Content> {
    let mut contents: Vec<Content> = Vec::new();
    let mut tool_names: HashMap<String, String> = HashMap::new();

    for msg in &req.messages {
        let role = if msg.is_assistant() { "model" } else { "user" };
        let mut parts = Vec::new();

        for block in msg.content.to_blocks() {
            match block {
                ContentBlock::Text { text } => {
                    if !text.trim().is_empty() {
                        parts.push(Part::text(text));
                    }
                }
                ContentBlock::Image { source } => match source.data {
                    Some(data) if source.source_type != "url" => parts.push(Part {
                        inline_data: Some(InlineData {
                            mime_type: source
                                .media_type
                                .unwrap_or_else(|| "image/png".to_string()),
                            data,
                        }),
                        ..Part::default()
                    }),
                    _ => {
                        if let Some(url) = source.url {
                            parts.push(Part::text(format!("Image URL: {url}")));
                        }
                    }
                },
                ContentBlock::ToolUse { id, name, input } => {
                    tool_names.insert(id.clone(), name.clone());
                    let thought_signature = cache
                        .thought_signature(&id)
                        .filter(|sig| is_valid_thought_signature(sig));
                    if thought_signature.is_none() {
                        debug!(tool_call_id = %id, "no usable thought signature for tool call");
                    }
                    parts.push(Part {
                        thought_signature,
                        function_call: Some(FunctionCall {
                            name,
                            args: input,
                            id: Some(id),
                            thought_signature: None,
                        }),
                        ..Part::default()
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let text = content.map(|c| c.to_text()).unwrap_or_default();
                    let response = if is_error.unwrap_or(false) {
                        serde_json::json!({ "error": text })
                    } else {
                        serde_json::json!({ "output": text })
                    };
                    parts.push(Part {
                        function_response: Some(FunctionResponse {
                            name: tool_names
                                .get(&tool_use_id)
                                .cloned()
                                .unwrap_or_else(|| "tool".to_string()),
                            response,
                            id: Some(tool_use_id),
                        }),
                        ..Part::default()
                    });
                }
                _ => {}
            }
        }

        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role == role => last.parts.extend(parts),
            _ => contents.push(Content {
                role: role.to_string(),
                parts,
            }),
        }
    }

    contents
}
