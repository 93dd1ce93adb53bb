//! OpenAI Chat Completions adapter.

use reqwest::header::HeaderMap;

use super::{PreparedRequest, UpstreamBody};
use crate::anthropic::AnthropicRequest;
use crate::cache::ToolCallCache;
use crate::transform::anthropic_to_openai;

const GEMINI_OPENAI_HOST: &str = "generativelanguage.googleapis.com";

/// Candidate chat-completions URLs, tried in order on 404.
///
/// Gemini's OpenAI-compatible surface has lived under both `/v1beta/openai`
/// and `/v1/openai`, so both are offered regardless of the configured path.
pub fn chat_completions_urls(base_url: &str) -> Vec<String> {
    let trimmed = base_url.trim_end_matches('/');

    if let Ok(url) = url::Url::parse(trimmed)
        && url.host_str() == Some(GEMINI_OPENAI_HOST)
    {
        let origin = url.origin().ascii_serialization();
        return vec![
            format!("{origin}/v1beta/openai/chat/completions"),
            format!("{origin}/v1/openai/chat/completions"),
        ];
    }

    if trimmed.ends_with("/chat/completions") {
        vec![trimmed.to_string()]
    } else {
        vec![format!("{trimmed}/chat/completions")]
    }
}

pub fn prepare(
    base_url: &str,
    req: &AnthropicRequest,
    model: &str,
    cache: &ToolCallCache,
) -> PreparedRequest {
    PreparedRequest {
        candidate_urls: chat_completions_urls(base_url),
        body: UpstreamBody::Chat(anthropic_to_openai(req, model, cache)),
        headers: HeaderMap::new(),
        stream: req.is_streaming(),
    }
}
