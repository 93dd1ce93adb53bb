//! Streaming reassembly: upstream SSE in, Anthropic SSE out.
//!
//! Bytes are framed into lines, each upstream has a `FrameDecoder` that turns
//! `data:` payloads into calls on a shared `StreamState`, and the state emits
//! typed `StreamEvent`s. A producer task owns the upstream body and feeds a
//! bounded channel the HTTP response drains.

mod chat;
mod cloudcode;
mod responses;
mod state;

pub use chat::ChatDecoder;
pub use cloudcode::CloudCodeDecoder;
pub use responses::ResponsesDecoder;
pub use state::StreamState;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::anthropic::{AnthropicResponse, AnthropicUsage, ResponseContent};
use crate::cache::ToolCallCache;
use crate::error::{ErrorBody, GatewayError};
use crate::transform::parse_tool_arguments;
use crate::upstream::EndpointMode;

/// Events buffered between the producer task and the HTTP body.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Anthropic stream events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: AnthropicResponse,
    },
    ContentBlockStart {
        index: usize,
        content_block: BlockStart,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: AnthropicUsage,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockStart {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
}

impl StreamEvent {
    pub fn error(err: &GatewayError) -> Self {
        StreamEvent::Error {
            error: err.envelope().error,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Error { .. } => "error",
        }
    }

    /// `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            warn!(error = %e, "failed to encode stream event");
            String::from("{}")
        });
        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}

// ============================================================================
// SSE framing
// ============================================================================

/// Line buffer over raw bytes. Lines are only decoded once complete, so a
/// UTF-8 sequence split across chunks is reassembled before decoding.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=newline).collect();
        Some(decode_line(&line[..newline]))
    }

    /// Whatever is left once the upstream closes without a final newline.
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Debug, PartialEq, Eq)]
pub enum SseLine<'a> {
    Done,
    Data(&'a str),
}

pub fn parse_sse_line(line: &str) -> Option<SseLine<'_>> {
    let line = line.trim_end_matches('\r');
    let data = line.strip_prefix("data:")?;
    let data = data.strip_prefix(' ').unwrap_or(data);
    if data.trim().is_empty() {
        return None;
    }
    if data.trim() == "[DONE]" {
        return Some(SseLine::Done);
    }
    Some(SseLine::Data(data))
}

// ============================================================================
// Decoders and the producer task
// ============================================================================

/// Turns one upstream's `data:` payloads into Anthropic events.
pub trait FrameDecoder: Send {
    /// Handle one `data:` payload. Malformed payloads are skipped; an `Err`
    /// means the upstream reported a failure in-band.
    fn data(&mut self, data: &str, out: &mut Vec<StreamEvent>) -> Result<(), GatewayError>;

    /// Close any open block and emit `message_delta` + `message_stop`.
    /// Calling it again emits nothing.
    fn finish(&mut self, out: &mut Vec<StreamEvent>);

    fn state(&self) -> &StreamState;
}

pub fn decoder_for(
    mode: EndpointMode,
    model: &str,
    cache: Arc<ToolCallCache>,
) -> Box<dyn FrameDecoder> {
    match mode {
        EndpointMode::OpenaiChat => Box::new(ChatDecoder::new(model, cache)),
        EndpointMode::OpenaiResponses => Box::new(ResponsesDecoder::new(model)),
        EndpointMode::CloudcodeSse => Box::new(CloudCodeDecoder::new(model, cache)),
    }
}

pub type EventResult = Result<StreamEvent, GatewayError>;

/// Spawn the producer. The receiver yields events until the message stops,
/// the upstream fails, or the receiver is dropped (which also drops the
/// upstream body).
pub fn spawn_producer<S, E>(
    bytes: S,
    decoder: Box<dyn FrameDecoder>,
    idle_timeout: Duration,
) -> mpsc::Receiver<EventResult>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(produce(bytes, decoder, idle_timeout, tx));
    rx
}

async fn produce<S, E>(
    bytes: S,
    mut decoder: Box<dyn FrameDecoder>,
    idle_timeout: Duration,
    tx: mpsc::Sender<EventResult>,
) where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: fmt::Display,
{
    futures::pin_mut!(bytes);
    let mut lines = SseLineBuffer::default();
    let mut out = Vec::new();

    loop {
        let read = tokio::select! {
            _ = tx.closed() => {
                debug!("client went away; dropping upstream stream");
                return;
            }
            read = tokio::time::timeout(idle_timeout, bytes.next()) => read,
        };
        let next = match read {
            Ok(next) => next,
            Err(_) => {
                if decoder.state().has_content() {
                    debug!(
                        idle_secs = idle_timeout.as_secs(),
                        "upstream stream went idle after content; finishing message"
                    );
                    decoder.finish(&mut out);
                    send_all(&tx, &mut out).await;
                } else {
                    let err = GatewayError::StreamTimeout {
                        idle_secs: idle_timeout.as_secs(),
                    };
                    warn!(error = %err, "upstream stream timed out");
                    let _ = tx.send(Err(err)).await;
                }
                return;
            }
        };

        match next {
            Some(Ok(chunk)) => {
                lines.push(&chunk);
                while let Some(line) = lines.next_line() {
                    if let Err(err) = process_line(decoder.as_mut(), &line, &mut out) {
                        fail(&tx, &mut out, err).await;
                        return;
                    }
                    if decoder.state().is_finished() {
                        break;
                    }
                }
                if !send_all(&tx, &mut out).await {
                    debug!("client went away; dropping upstream stream");
                    return;
                }
                if decoder.state().is_finished() {
                    return;
                }
            }
            Some(Err(e)) => {
                let err = GatewayError::Transport(format!("Upstream stream failed: {e}"));
                fail(&tx, &mut out, err).await;
                return;
            }
            None => {
                if let Some(line) = lines.take_rest()
                    && let Err(err) = process_line(decoder.as_mut(), &line, &mut out)
                {
                    fail(&tx, &mut out, err).await;
                    return;
                }
                decoder.finish(&mut out);
                send_all(&tx, &mut out).await;
                return;
            }
        }
    }
}

fn process_line(
    decoder: &mut dyn FrameDecoder,
    line: &str,
    out: &mut Vec<StreamEvent>,
) -> Result<(), GatewayError> {
    match parse_sse_line(line) {
        None => Ok(()),
        Some(SseLine::Done) => {
            decoder.finish(out);
            Ok(())
        }
        Some(SseLine::Data(data)) => decoder.data(data, out),
    }
}

/// Forward buffered events; `false` once the receiver is gone.
async fn send_all(tx: &mpsc::Sender<EventResult>, out: &mut Vec<StreamEvent>) -> bool {
    for event in out.drain(..) {
        if tx.send(Ok(event)).await.is_err() {
            return false;
        }
    }
    true
}

async fn fail(tx: &mpsc::Sender<EventResult>, out: &mut Vec<StreamEvent>, err: GatewayError) {
    warn!(error = %err, "upstream stream failed");
    if send_all(tx, out).await {
        let _ = tx.send(Err(err)).await;
    }
}

// ============================================================================
// Folding a stream back into one response
// ============================================================================

enum PartialBlock {
    Text(String),
    Thinking {
        thinking: String,
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        json: String,
    },
}

/// Rebuild the message an event sequence describes.
pub fn collect_events(
    events: impl IntoIterator<Item = StreamEvent>,
) -> Result<AnthropicResponse, GatewayError> {
    let mut id = String::new();
    let mut model = String::new();
    let mut usage = AnthropicUsage::default();
    let mut stop_reason = None;
    let mut blocks: BTreeMap<usize, PartialBlock> = BTreeMap::new();

    for event in events {
        match event {
            StreamEvent::MessageStart { message } => {
                id = message.id;
                model = message.model;
                usage.input_tokens = message.usage.input_tokens;
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                let block = match content_block {
                    BlockStart::Text { text } => PartialBlock::Text(text),
                    BlockStart::Thinking { thinking } => PartialBlock::Thinking {
                        thinking,
                        signature: None,
                    },
                    BlockStart::ToolUse { id, name, .. } => PartialBlock::ToolUse {
                        id,
                        name,
                        json: String::new(),
                    },
                };
                blocks.insert(index, block);
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                match (blocks.get_mut(&index), delta) {
                    (Some(PartialBlock::Text(text)), BlockDelta::TextDelta { text: more }) => {
                        text.push_str(&more)
                    }
                    (
                        Some(PartialBlock::Thinking { thinking, .. }),
                        BlockDelta::ThinkingDelta { thinking: more },
                    ) => thinking.push_str(&more),
                    (
                        Some(PartialBlock::Thinking { signature, .. }),
                        BlockDelta::SignatureDelta { signature: sig },
                    ) => *signature = Some(sig),
                    (
                        Some(PartialBlock::ToolUse { json, .. }),
                        BlockDelta::InputJsonDelta { partial_json },
                    ) => json.push_str(&partial_json),
                    (_, delta) => debug!(index, ?delta, "delta for unknown block ignored"),
                }
            }
            StreamEvent::MessageDelta { delta, usage: u } => {
                stop_reason = delta.stop_reason;
                usage.output_tokens = u.output_tokens;
                if u.input_tokens > 0 {
                    usage.input_tokens = u.input_tokens;
                }
            }
            StreamEvent::Error { error } => {
                return Err(GatewayError::Upstream {
                    status: StatusCode::BAD_GATEWAY,
                    message: error.message,
                });
            }
            StreamEvent::ContentBlockStop { .. } | StreamEvent::MessageStop => {}
        }
    }

    let content = blocks
        .into_values()
        .map(|block| match block {
            PartialBlock::Text(text) => ResponseContent::Text { text },
            PartialBlock::Thinking {
                thinking,
                signature,
            } => ResponseContent::Thinking {
                thinking,
                signature,
            },
            PartialBlock::ToolUse { id, name, json } => ResponseContent::ToolUse {
                id,
                name,
                input: parse_tool_arguments(&json),
            },
        })
        .collect();

    Ok(AnthropicResponse::new(
        id,
        &model,
        content,
        stop_reason.unwrap_or_else(|| "end_turn".to_string()),
        usage,
    ))
}

/// Drain a producer into one response. The first error wins.
pub async fn collect(mut rx: mpsc::Receiver<EventResult>) -> Result<AnthropicResponse, GatewayError> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event?);
    }
    collect_events(events)
}
