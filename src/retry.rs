//! Retry ladder classification.
//!
//! `classify` looks at one failed upstream attempt and decides the single
//! corrective action to take next. It is pure: the dispatcher owns the
//! request, applies the action and records it in `RetryFlags` so that no rule
//! fires twice for one logical request.

use std::sync::LazyLock;

use regex::Regex;
use reqwest::StatusCode;

use crate::upstream::EndpointMode;

/// Upper bound applied to `max_tokens` by strict sanitization.
pub const STRICT_MAX_TOKENS: u32 = 196_608;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    RefreshCredential,
    NextCandidateUrl,
    ClampMaxTokens { min: u32, max: u32 },
    StrictSanitize,
    AddUserProjectHeader,
    DropThinkingLevel,
    Surface,
}

/// Rules already applied during this logical request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryFlags {
    pub refreshed_credential: bool,
    pub clamped_max_tokens: bool,
    pub strict_sanitized: bool,
    pub added_user_project: bool,
    pub dropped_thinking_level: bool,
}

impl RetryFlags {
    pub fn record(&mut self, action: RetryAction) {
        match action {
            RetryAction::RefreshCredential => self.refreshed_credential = true,
            RetryAction::ClampMaxTokens { .. } => self.clamped_max_tokens = true,
            RetryAction::StrictSanitize => self.strict_sanitized = true,
            RetryAction::AddUserProjectHeader => self.added_user_project = true,
            RetryAction::DropThinkingLevel => self.dropped_thinking_level = true,
            // Bounded by the candidate list itself.
            RetryAction::NextCandidateUrl | RetryAction::Surface => {}
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FailureContext<'a> {
    pub status: StatusCode,
    /// Raw upstream error body.
    pub body: &'a str,
    pub endpoint_mode: EndpointMode,
    pub refreshable: bool,
    pub has_next_url: bool,
    pub quirks: &'a ProviderQuirks,
    pub flags: RetryFlags,
}

pub fn classify(ctx: &FailureContext<'_>) -> RetryAction {
    let status = ctx.status;
    let flags = ctx.flags;
    let text = ctx.body.to_ascii_lowercase();
    let is_cloudcode = ctx.endpoint_mode == EndpointMode::CloudcodeSse;

    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
        && ctx.refreshable
        && !flags.refreshed_credential
    {
        return RetryAction::RefreshCredential;
    }

    if status == StatusCode::NOT_FOUND && ctx.has_next_url {
        return RetryAction::NextCandidateUrl;
    }

    if status == StatusCode::BAD_REQUEST
        && !flags.clamped_max_tokens
        && let Some((min, max)) = parse_max_tokens_range(ctx.body)
    {
        return RetryAction::ClampMaxTokens { min, max };
    }

    if status == StatusCode::BAD_REQUEST
        && !is_cloudcode
        && !flags.strict_sanitized
        && ctx.quirks.is_strict_trigger(&text)
    {
        return RetryAction::StrictSanitize;
    }

    if is_cloudcode {
        if matches!(status, StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN)
            && !flags.added_user_project
            && text.contains("x-goog-user-project")
        {
            return RetryAction::AddUserProjectHeader;
        }
        if status == StatusCode::BAD_REQUEST
            && !flags.dropped_thinking_level
            && mentions_thinking_level(&text)
        {
            return RetryAction::DropThinkingLevel;
        }
    }

    RetryAction::Surface
}

static MAX_TOKENS_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)max_tokens[^0-9\[]*?(?:between\s+(\d+)\s+and\s+(\d+)|\[\s*(\d+)\s*,\s*(\d+)\s*\])",
    )
    .expect("max_tokens range pattern is valid")
});

/// `max_tokens must be between X and Y` or `... max_tokens ... [X, Y]`.
pub fn parse_max_tokens_range(text: &str) -> Option<(u32, u32)> {
    let caps = MAX_TOKENS_RANGE.captures(text)?;
    let number = |a: usize, b: usize| {
        caps.get(a)
            .or_else(|| caps.get(b))
            .and_then(|m| m.as_str().parse::<u32>().ok())
    };
    let low = number(1, 3)?;
    let high = number(2, 4)?;
    Some((low.min(high), low.max(high)))
}

fn mentions_thinking_level(text: &str) -> bool {
    ["thinking_level", "thinkinglevel", "thinking level"]
        .iter()
        .any(|needle| text.contains(needle))
}

// ============================================================================
// Provider quirks
// ============================================================================

/// Per-provider knobs for the strict sanitization rule.
#[derive(Debug, PartialEq, Eq)]
pub struct ProviderQuirks {
    pub name: &'static str,
    /// Lowercase substrings of a 400 body that trigger strict sanitization.
    pub strict_triggers: &'static [&'static str],
    /// Provider rejects more than one system message.
    pub single_system_message: bool,
}

impl ProviderQuirks {
    pub fn is_strict_trigger(&self, lowercase_body: &str) -> bool {
        self.strict_triggers
            .iter()
            .any(|trigger| lowercase_body.contains(trigger))
    }
}

const DEFAULT_STRICT_TRIGGERS: &[&str] = &["invalid chat setting", "invalid params", "(2013)"];

pub static DEFAULT_QUIRKS: ProviderQuirks = ProviderQuirks {
    name: "default",
    strict_triggers: DEFAULT_STRICT_TRIGGERS,
    single_system_message: false,
};

static KNOWN_QUIRKS: &[ProviderQuirks] = &[
    ProviderQuirks {
        name: "minimax",
        strict_triggers: DEFAULT_STRICT_TRIGGERS,
        single_system_message: true,
    },
];

/// Match the provider name first, then the base URL host.
pub fn quirks_for(provider: &str, base_url: &str) -> &'static ProviderQuirks {
    let provider = provider.to_ascii_lowercase();
    let host = url::Url::parse(base_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default();

    KNOWN_QUIRKS
        .iter()
        .find(|q| provider.contains(q.name))
        .or_else(|| KNOWN_QUIRKS.iter().find(|q| host.contains(q.name)))
        .unwrap_or(&DEFAULT_QUIRKS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(status: StatusCode, body: &str) -> FailureContext<'_> {
        FailureContext {
            status,
            body,
            endpoint_mode: EndpointMode::OpenaiChat,
            refreshable: false,
            has_next_url: false,
            quirks: &DEFAULT_QUIRKS,
            flags: RetryFlags::default(),
        }
    }

    #[test]
    fn parses_both_range_spellings() {
        assert_eq!(
            parse_max_tokens_range("max_tokens must be between 1 and 4096"),
            Some((1, 4096))
        );
        assert_eq!(
            parse_max_tokens_range(
                r#"{"error":{"message":"Invalid max_tokens value, the valid range of max_tokens is [1, 8192]"}}"#
            ),
            Some((1, 8192))
        );
        assert_eq!(parse_max_tokens_range("temperature must be between 0 and 2"), None);
    }

    #[test]
    fn clamp_fires_once() {
        let body = "max_tokens must be between 1 and 4096";
        let first = ctx(StatusCode::BAD_REQUEST, body);
        assert_eq!(
            classify(&first),
            RetryAction::ClampMaxTokens { min: 1, max: 4096 }
        );

        let mut flags = RetryFlags::default();
        flags.record(classify(&first));
        let second = FailureContext { flags, ..first };
        assert_eq!(classify(&second), RetryAction::Surface);
    }

    #[test]
    fn auth_refresh_requires_resolver_and_fires_once() {
        let plain = ctx(StatusCode::UNAUTHORIZED, "bad key");
        assert_eq!(classify(&plain), RetryAction::Surface);

        let refreshable = FailureContext {
            refreshable: true,
            ..plain
        };
        assert_eq!(classify(&refreshable), RetryAction::RefreshCredential);

        let mut flags = RetryFlags::default();
        flags.record(RetryAction::RefreshCredential);
        assert_eq!(
            classify(&FailureContext {
                flags,
                ..refreshable
            }),
            RetryAction::Surface
        );
    }

    #[test]
    fn not_found_walks_candidates() {
        let c = FailureContext {
            has_next_url: true,
            ..ctx(StatusCode::NOT_FOUND, "")
        };
        assert_eq!(classify(&c), RetryAction::NextCandidateUrl);
        assert_eq!(
            classify(&ctx(StatusCode::NOT_FOUND, "")),
            RetryAction::Surface
        );
    }

    #[test]
    fn strict_trigger_comes_from_quirk_table() {
        let c = ctx(
            StatusCode::BAD_REQUEST,
            r#"{"base_resp":{"status_code":2013,"status_msg":"invalid params, (2013)"}}"#,
        );
        assert_eq!(classify(&c), RetryAction::StrictSanitize);
        assert_eq!(
            classify(&ctx(StatusCode::BAD_REQUEST, "model not found")),
            RetryAction::Surface
        );

        let quirks = quirks_for("MiniMax", "https://api.minimax.io/v1");
        assert!(quirks.single_system_message);
        assert_eq!(
            quirks_for("", "https://api.minimax.io/v1").name,
            "minimax"
        );
        assert_eq!(quirks_for("openai", "https://api.openai.com/v1").name, "default");
    }

    #[test]
    fn cloudcode_rules_only_apply_to_cloudcode() {
        let body = "Missing required header x-goog-user-project";
        let chat = ctx(StatusCode::FORBIDDEN, body);
        assert_eq!(classify(&chat), RetryAction::Surface);

        let cc = FailureContext {
            endpoint_mode: EndpointMode::CloudcodeSse,
            ..chat
        };
        assert_eq!(classify(&cc), RetryAction::AddUserProjectHeader);

        let level = FailureContext {
            endpoint_mode: EndpointMode::CloudcodeSse,
            ..ctx(
                StatusCode::BAD_REQUEST,
                "Invalid value at 'request.generation_config.thinking_config.thinking_level'",
            )
        };
        assert_eq!(classify(&level), RetryAction::DropThinkingLevel);
    }
}
