use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use super::{BlockDelta, BlockStart, MessageDeltaBody, StreamEvent};
use crate::anthropic::{
    AnthropicResponse, AnthropicUsage, ResponseContent, new_message_id, new_tool_use_id,
};
use crate::think::{Segment, ThinkTagSplitter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Thinking,
    Text,
    /// A streamed tool call keyed by the provider's index. `None` is a call
    /// delivered whole, which is opened and closed in one go.
    Tool(Option<u32>),
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    kind: BlockKind,
    index: usize,
}

#[derive(Debug, Default)]
struct ToolSlot {
    id: Option<String>,
    name: Option<String>,
    /// Argument fragments not yet forwarded.
    pending_args: String,
    opened: bool,
}

/// Per-request reassembly state.
///
/// At most one content block is open at a time. Block indices only advance
/// when a block closes, `message_start` precedes every content event and
/// `message_stop` is emitted exactly once.
#[derive(Debug)]
pub struct StreamState {
    message_id: String,
    model: String,
    next_index: usize,
    open: Option<OpenBlock>,
    message_started: bool,
    message_stopped: bool,
    content_started: bool,
    saw_tool_use: bool,
    tools: HashMap<u32, ToolSlot>,
    splitter: ThinkTagSplitter,
    usage: AnthropicUsage,
    stop_reason: Option<String>,
}

impl StreamState {
    pub fn new(model: &str) -> Self {
        Self {
            message_id: new_message_id(),
            model: model.to_string(),
            next_index: 0,
            open: None,
            message_started: false,
            message_stopped: false,
            content_started: false,
            saw_tool_use: false,
            tools: HashMap::new(),
            splitter: ThinkTagSplitter::new(),
            usage: AnthropicUsage::default(),
            stop_reason: None,
        }
    }

    /// Whether any content block has been started.
    pub fn has_content(&self) -> bool {
        self.content_started
    }

    pub fn is_finished(&self) -> bool {
        self.message_stopped
    }

    pub fn saw_tool_use(&self) -> bool {
        self.saw_tool_use
    }

    pub fn tool_id(&self, key: u32) -> Option<&str> {
        self.tools.get(&key).and_then(|slot| slot.id.as_deref())
    }

    pub fn set_usage(&mut self, input_tokens: Option<u32>, output_tokens: Option<u32>) {
        if let Some(input) = input_tokens {
            self.usage.input_tokens = input;
        }
        if let Some(output) = output_tokens {
            self.usage.output_tokens = output;
        }
    }

    pub fn set_stop_reason(&mut self, reason: impl Into<String>) {
        self.stop_reason = Some(reason.into());
    }

    // ---- block bookkeeping ----

    fn ensure_message_started(&mut self, out: &mut Vec<StreamEvent>) {
        if self.message_started {
            return;
        }
        self.message_started = true;
        let mut message = AnthropicResponse::new(
            self.message_id.clone(),
            &self.model,
            Vec::new(),
            String::new(),
            AnthropicUsage {
                input_tokens: self.usage.input_tokens,
                output_tokens: 0,
            },
        );
        message.stop_reason = None;
        out.push(StreamEvent::MessageStart { message });
    }

    fn close_block(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(block) = self.open.take() {
            out.push(StreamEvent::ContentBlockStop { index: block.index });
            self.next_index += 1;
        }
    }

    /// Open a block of `kind` unless it is already the open one. Returns the
    /// block's index, or `None` once the message has stopped.
    fn open_block(
        &mut self,
        kind: BlockKind,
        start: impl FnOnce() -> BlockStart,
        out: &mut Vec<StreamEvent>,
    ) -> Option<usize> {
        if self.message_stopped {
            return None;
        }
        self.ensure_message_started(out);
        if let Some(block) = self.open
            && block.kind == kind
        {
            return Some(block.index);
        }
        self.close_block(out);
        let index = self.next_index;
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: start(),
        });
        self.open = Some(OpenBlock { kind, index });
        self.content_started = true;
        Some(index)
    }

    // ---- text and thinking ----

    /// Visible text, which may carry inline `<think>` markers.
    pub fn text(&mut self, chunk: &str, out: &mut Vec<StreamEvent>) {
        if self.message_stopped {
            return;
        }
        let segments = self.splitter.push(chunk);
        self.emit_segments(segments, out);
    }

    /// Reasoning delivered out of band.
    pub fn thinking(&mut self, chunk: &str, out: &mut Vec<StreamEvent>) {
        if self.message_stopped {
            return;
        }
        self.flush_splitter(out);
        self.emit_thinking(chunk, out);
    }

    /// Signature for the thinking block currently open. Dropped otherwise.
    pub fn thinking_signature(&mut self, signature: &str, out: &mut Vec<StreamEvent>) {
        match self.open {
            Some(OpenBlock {
                kind: BlockKind::Thinking,
                index,
            }) if !signature.is_empty() => out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::SignatureDelta {
                    signature: signature.to_string(),
                },
            }),
            _ => debug!("thought signature without an open thinking block"),
        }
    }

    fn flush_splitter(&mut self, out: &mut Vec<StreamEvent>) {
        let segments = self.splitter.flush();
        self.emit_segments(segments, out);
    }

    fn emit_segments(&mut self, segments: Vec<Segment>, out: &mut Vec<StreamEvent>) {
        for segment in segments {
            match segment {
                Segment::Text(text) => self.emit_text(&text, out),
                Segment::Thinking(thinking) => self.emit_thinking(&thinking, out),
            }
        }
    }

    fn emit_text(&mut self, text: &str, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        let Some(index) = self.open_block(
            BlockKind::Text,
            || BlockStart::Text {
                text: String::new(),
            },
            out,
        ) else {
            return;
        };
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn emit_thinking(&mut self, thinking: &str, out: &mut Vec<StreamEvent>) {
        if thinking.is_empty() {
            return;
        }
        let Some(index) = self.open_block(
            BlockKind::Thinking,
            || BlockStart::Thinking {
                thinking: String::new(),
            },
            out,
        ) else {
            return;
        };
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::ThinkingDelta {
                thinking: thinking.to_string(),
            },
        });
    }

    // ---- tool calls ----

    /// One streamed tool-call fragment. The block opens once the name is
    /// known; arguments seen before that are held back and flushed on open.
    /// Text still held by the think-tag splitter is emitted first.
    pub fn tool_delta(
        &mut self,
        key: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
        out: &mut Vec<StreamEvent>,
    ) {
        if self.message_stopped {
            return;
        }
        self.flush_splitter(out);
        let slot = self.tools.entry(key).or_default();
        if slot.id.is_none()
            && let Some(id) = id.filter(|id| !id.is_empty())
        {
            slot.id = Some(id.to_string());
        }
        if slot.name.is_none()
            && let Some(name) = name.filter(|name| !name.is_empty())
        {
            slot.name = Some(name.to_string());
        }
        if let Some(arguments) = arguments {
            slot.pending_args.push_str(arguments);
        }

        if !slot.opened {
            let Some(name) = slot.name.clone() else {
                return;
            };
            let id = slot.id.get_or_insert_with(new_tool_use_id).clone();
            slot.opened = true;
            self.open_block(
                BlockKind::Tool(Some(key)),
                || BlockStart::ToolUse {
                    id,
                    name,
                    input: Value::Object(Default::default()),
                },
                out,
            );
            self.saw_tool_use = true;
        }

        let Some(open) = self.open else {
            return;
        };
        let Some(slot) = self.tools.get_mut(&key) else {
            return;
        };
        if slot.pending_args.is_empty() {
            return;
        }
        if open.kind == BlockKind::Tool(Some(key)) {
            out.push(StreamEvent::ContentBlockDelta {
                index: open.index,
                delta: BlockDelta::InputJsonDelta {
                    partial_json: std::mem::take(&mut slot.pending_args),
                },
            });
        } else {
            debug!(key, "arguments for a tool call whose block already closed");
            slot.pending_args.clear();
        }
    }

    /// A tool call delivered in one piece.
    pub fn tool_call(&mut self, id: &str, name: &str, input: &Value, out: &mut Vec<StreamEvent>) {
        if self.message_stopped {
            return;
        }
        self.flush_splitter(out);
        self.close_block(out);
        let Some(index) = self.open_block(
            BlockKind::Tool(None),
            || BlockStart::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: Value::Object(Default::default()),
            },
            out,
        ) else {
            return;
        };
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta {
                partial_json: input.to_string(),
            },
        });
        self.close_block(out);
        self.saw_tool_use = true;
    }

    /// Replay a complete response as events, used when an upstream only
    /// delivered the final object.
    pub fn replay(&mut self, resp: &AnthropicResponse, out: &mut Vec<StreamEvent>) {
        if self.message_stopped {
            return;
        }
        for block in &resp.content {
            match block {
                ResponseContent::Text { text } => {
                    self.flush_splitter(out);
                    self.emit_text(text, out);
                }
                ResponseContent::Thinking {
                    thinking,
                    signature,
                } => {
                    self.thinking(thinking, out);
                    if let Some(signature) = signature {
                        self.thinking_signature(signature, out);
                    }
                }
                ResponseContent::ToolUse { id, name, input } => {
                    self.tool_call(id, name, input, out)
                }
            }
        }
        self.set_usage(
            Some(resp.usage.input_tokens),
            Some(resp.usage.output_tokens),
        );
        if let Some(reason) = &resp.stop_reason {
            self.set_stop_reason(reason.clone());
        }
    }

    /// Close everything and stop the message. Idempotent.
    pub fn finish(&mut self, out: &mut Vec<StreamEvent>) {
        if self.message_stopped {
            return;
        }
        self.flush_splitter(out);
        self.ensure_message_started(out);
        self.close_block(out);

        let stop_reason = match self.stop_reason.take() {
            Some(reason) if reason == "end_turn" && self.saw_tool_use => "tool_use".to_string(),
            Some(reason) => reason,
            None if self.saw_tool_use => "tool_use".to_string(),
            None => "end_turn".to_string(),
        };
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self.usage,
        });
        out.push(StreamEvent::MessageStop);
        self.message_stopped = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Event names with block indices, for compact assertions.
    fn trace(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .map(|event| match event {
                StreamEvent::ContentBlockStart {
                    index,
                    content_block,
                } => {
                    let kind = match content_block {
                        BlockStart::Text { .. } => "text",
                        BlockStart::Thinking { .. } => "thinking",
                        BlockStart::ToolUse { .. } => "tool_use",
                    };
                    format!("start:{index}:{kind}")
                }
                StreamEvent::ContentBlockDelta { index, .. } => format!("delta:{index}"),
                StreamEvent::ContentBlockStop { index } => format!("stop:{index}"),
                other => other.name().to_string(),
            })
            .collect()
    }

    #[test]
    fn block_changes_close_before_opening() {
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        state.thinking("plan", &mut out);
        state.text("answer", &mut out);
        state.tool_delta(0, Some("call_1"), Some("ls"), Some("{}"), &mut out);
        state.finish(&mut out);

        assert_eq!(
            trace(&out),
            vec![
                "message_start",
                "start:0:thinking",
                "delta:0",
                "stop:0",
                "start:1:text",
                "delta:1",
                "stop:1",
                "start:2:tool_use",
                "delta:2",
                "stop:2",
                "message_delta",
                "message_stop",
            ]
        );
        match &out[out.len() - 2] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("tool_use"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tool_arguments_wait_for_the_name() {
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        state.tool_delta(3, Some("call_1"), None, Some("{\"pa"), &mut out);
        assert!(out.is_empty());
        state.tool_delta(3, None, Some("read"), Some("th\":1}"), &mut out);

        assert_eq!(trace(&out), vec!["message_start", "start:0:tool_use", "delta:0"]);
        assert_eq!(
            out[2],
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: BlockDelta::InputJsonDelta {
                    partial_json: "{\"path\":1}".into()
                }
            }
        );
        assert_eq!(state.tool_id(3), Some("call_1"));
    }

    #[test]
    fn distinct_tool_indices_get_distinct_blocks() {
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        state.tool_delta(0, Some("a"), Some("f"), Some("{}"), &mut out);
        state.tool_delta(1, Some("b"), Some("g"), Some("{}"), &mut out);
        state.finish(&mut out);

        assert_eq!(
            trace(&out),
            vec![
                "message_start",
                "start:0:tool_use",
                "delta:0",
                "stop:0",
                "start:1:tool_use",
                "delta:1",
                "stop:1",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn think_tags_split_across_chunks() {
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        for chunk in ["<thi", "nk>why</th", "ink>because"] {
            state.text(chunk, &mut out);
        }
        state.finish(&mut out);

        assert_eq!(
            trace(&out),
            vec![
                "message_start",
                "start:0:thinking",
                "delta:0",
                "stop:0",
                "start:1:text",
                "delta:1",
                "stop:1",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn finish_is_idempotent_and_starts_the_message() {
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        state.finish(&mut out);
        state.finish(&mut out);
        assert_eq!(trace(&out), vec!["message_start", "message_delta", "message_stop"]);
        assert!(state.is_finished());
        assert!(!state.has_content());
    }

    #[test]
    fn nothing_follows_message_stop() {
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        state.text("done", &mut out);
        state.finish(&mut out);
        let stopped = out.len();

        state.text("late", &mut out);
        state.thinking("late", &mut out);
        state.tool_delta(0, Some("a"), Some("f"), Some("{}"), &mut out);
        state.tool_call("b", "g", &json!({}), &mut out);
        state.finish(&mut out);

        assert_eq!(out.len(), stopped);
        assert_eq!(out.last(), Some(&StreamEvent::MessageStop));
    }

    #[test]
    fn held_text_is_flushed_before_more_tool_arguments() {
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        state.tool_delta(0, Some("a"), Some("f"), Some("{\"x\""), &mut out);
        // "<" could start a think tag, so the splitter holds it back.
        state.text("<", &mut out);
        state.tool_delta(0, None, None, Some(":1}"), &mut out);
        state.finish(&mut out);

        assert_eq!(
            trace(&out),
            vec![
                "message_start",
                "start:0:tool_use",
                "delta:0",
                "stop:0",
                "start:1:text",
                "delta:1",
                "stop:1",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(
            out[5],
            StreamEvent::ContentBlockDelta {
                index: 1,
                delta: BlockDelta::TextDelta { text: "<".into() }
            }
        );
    }

    #[test]
    fn whole_tool_calls_open_and_close_immediately() {
        let mut state = StreamState::new("m");
        let mut out = Vec::new();
        state.tool_call("t1", "ls", &json!({"p": "."}), &mut out);
        state.tool_call("t2", "ls", &json!({"p": "/"}), &mut out);
        assert_eq!(
            trace(&out),
            vec![
                "message_start",
                "start:0:tool_use",
                "delta:0",
                "stop:0",
                "start:1:tool_use",
                "delta:1",
                "stop:1",
            ]
        );
    }
}
