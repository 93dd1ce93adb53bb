//! OpenAI Responses API event decoder.

use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use super::{FrameDecoder, StreamEvent, StreamState};
use crate::error::GatewayError;
use crate::openai::{FunctionCallIds, ResponseOutputItem, ResponsesResponse, ResponsesStreamEvent};
use crate::transform::{responses_stop_reason, responses_to_anthropic};

/// One function call, correlated across events by whichever id is present.
#[derive(Debug, Default)]
struct FunctionCallState {
    key: u32,
    call_id: Option<String>,
    item_id: Option<String>,
    output_index: Option<u32>,
    name: Option<String>,
    /// Name and id have been forwarded.
    metadata_emitted: bool,
    /// Arguments have been forwarded, either as deltas or whole.
    emitted: bool,
}

impl FunctionCallState {
    fn matches(&self, ids: &FunctionCallIds) -> bool {
        let same = |mine: &Option<String>, theirs: &Option<String>| {
            matches!((mine, theirs), (Some(a), Some(b)) if a == b)
        };
        same(&self.call_id, &ids.call_id)
            || same(&self.item_id, &ids.item_id)
            || matches!((self.output_index, ids.output_index), (Some(a), Some(b)) if a == b)
    }

    fn absorb(&mut self, ids: &FunctionCallIds) {
        if self.call_id.is_none() {
            self.call_id.clone_from(&ids.call_id);
        }
        if self.item_id.is_none() {
            self.item_id.clone_from(&ids.item_id);
        }
        if self.output_index.is_none() {
            self.output_index = ids.output_index;
        }
    }
}

pub struct ResponsesDecoder {
    state: StreamState,
    model: String,
    calls: Vec<FunctionCallState>,
    /// Any incremental content seen; without it the final object is replayed.
    saw_delta: bool,
}

impl ResponsesDecoder {
    pub fn new(model: &str) -> Self {
        Self {
            state: StreamState::new(model),
            model: model.to_string(),
            calls: Vec::new(),
            saw_delta: false,
        }
    }

    fn call_index(&mut self, ids: &FunctionCallIds) -> usize {
        if let Some(pos) = self.calls.iter().position(|call| call.matches(ids)) {
            self.calls[pos].absorb(ids);
            return pos;
        }
        let mut call = FunctionCallState {
            key: self.calls.len() as u32,
            ..FunctionCallState::default()
        };
        call.absorb(ids);
        self.calls.push(call);
        self.calls.len() - 1
    }

    /// Forward name/id once a name is known, then `arguments` as a fragment.
    fn forward(&mut self, pos: usize, arguments: Option<&str>, out: &mut Vec<StreamEvent>) {
        let call = &mut self.calls[pos];
        let metadata = if !call.metadata_emitted && call.name.is_some() {
            call.metadata_emitted = true;
            Some((
                call.call_id.clone().or_else(|| call.item_id.clone()),
                call.name.clone(),
            ))
        } else {
            None
        };
        let arguments = arguments.filter(|a| !a.is_empty());
        if arguments.is_some() {
            call.emitted = true;
        }
        let key = call.key;

        if metadata.is_none() && arguments.is_none() {
            return;
        }
        let (id, name) = metadata.unwrap_or((None, None));
        self.state
            .tool_delta(key, id.as_deref(), name.as_deref(), arguments, out);
    }

    /// `.done` style events carry the full arguments; forward them only if
    /// nothing was streamed for this call.
    fn complete_call(
        &mut self,
        ids: &FunctionCallIds,
        name: Option<&str>,
        arguments: Option<&str>,
        out: &mut Vec<StreamEvent>,
    ) {
        let pos = self.call_index(ids);
        if self.calls[pos].name.is_none() {
            self.calls[pos].name = name.map(str::to_string);
        }
        let arguments = if self.calls[pos].emitted {
            None
        } else {
            arguments
        };
        self.forward(pos, arguments, out);
    }

    /// Some upstreams send both `response.completed` and `response.done`;
    /// only the first one counts.
    fn complete(&mut self, response: &ResponsesResponse, out: &mut Vec<StreamEvent>) {
        if self.state.is_finished() {
            return;
        }
        if self.saw_delta {
            if let Some(usage) = response.usage {
                self.state
                    .set_usage(Some(usage.input_tokens), Some(usage.output_tokens));
            }
            let reason = responses_stop_reason(response, self.state.saw_tool_use());
            self.state.set_stop_reason(reason);
        } else {
            let resp = responses_to_anthropic(response, &self.model);
            self.state.replay(&resp, out);
        }
        self.state.finish(out);
    }
}

fn item_ids(output_index: Option<u32>, id: &Option<String>, call_id: &Option<String>) -> FunctionCallIds {
    FunctionCallIds {
        call_id: call_id.clone(),
        item_id: id.clone(),
        output_index,
    }
}

fn failure_message(response: &Value) -> String {
    response
        .pointer("/error/message")
        .and_then(Value::as_str)
        .unwrap_or("Upstream response failed")
        .to_string()
}

impl FrameDecoder for ResponsesDecoder {
    fn data(&mut self, data: &str, out: &mut Vec<StreamEvent>) -> Result<(), GatewayError> {
        let event: ResponsesStreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "skipping malformed responses event");
                return Ok(());
            }
        };

        match event {
            ResponsesStreamEvent::OutputTextDelta { delta } => {
                self.saw_delta = true;
                self.state.text(&delta, out);
            }
            ResponsesStreamEvent::ReasoningDelta { delta } => {
                self.saw_delta = true;
                self.state.thinking(&delta, out);
            }
            ResponsesStreamEvent::OutputItemAdded { output_index, item } => {
                if let ResponseOutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    arguments,
                } = item
                {
                    self.saw_delta = true;
                    let pos = self.call_index(&item_ids(output_index, &id, &call_id));
                    if self.calls[pos].name.is_none() {
                        self.calls[pos].name = name;
                    }
                    self.forward(pos, arguments.as_deref(), out);
                }
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta { ids, delta } => {
                self.saw_delta = true;
                let pos = self.call_index(&ids);
                self.forward(pos, Some(&delta), out);
            }
            ResponsesStreamEvent::FunctionCallArgumentsDone {
                ids,
                name,
                arguments,
            } => {
                self.saw_delta = true;
                self.complete_call(&ids, name.as_deref(), arguments.as_deref(), out);
            }
            ResponsesStreamEvent::OutputItemDone { output_index, item } => {
                if let ResponseOutputItem::FunctionCall {
                    id,
                    call_id,
                    name,
                    arguments,
                } = item
                {
                    self.saw_delta = true;
                    self.complete_call(
                        &item_ids(output_index, &id, &call_id),
                        name.as_deref(),
                        arguments.as_deref(),
                        out,
                    );
                }
            }
            ResponsesStreamEvent::Completed { response }
            | ResponsesStreamEvent::Incomplete { response } => self.complete(&response, out),
            ResponsesStreamEvent::Failed { response } => {
                return Err(GatewayError::Upstream {
                    status: StatusCode::BAD_GATEWAY,
                    message: failure_message(&response),
                });
            }
            ResponsesStreamEvent::Error { message } => {
                return Err(GatewayError::Upstream {
                    status: StatusCode::BAD_GATEWAY,
                    message: message.unwrap_or_else(|| "Upstream stream error".to_string()),
                });
            }
            ResponsesStreamEvent::Other => {}
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut Vec<StreamEvent>) {
        self.state.finish(out);
    }

    fn state(&self) -> &StreamState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::ResponseContent;
    use crate::stream::{BlockDelta, collect, spawn_producer, tests::frames};
    use futures::stream;
    use serde_json::json;
    use std::time::Duration;

    async fn run(payload: &str) -> crate::anthropic::AnthropicResponse {
        let rx = spawn_producer(
            stream::iter(frames(payload)),
            Box::new(ResponsesDecoder::new("claude")),
            Duration::from_secs(5),
        );
        collect(rx).await.unwrap()
    }

    fn events(lines: &[Value]) -> String {
        lines
            .iter()
            .map(|line| format!("event: x\ndata: {line}\n\n"))
            .collect()
    }

    #[tokio::test]
    async fn streams_text_and_function_call_once() {
        let payload = events(&[
            json!({"type": "response.reasoning_summary_text.delta", "delta": "think"}),
            json!({"type": "response.output_text.delta", "delta": "Hello"}),
            json!({"type": "response.output_item.added", "output_index": 1,
                   "item": {"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "tool", "arguments": "{\"x\":1"}}),
            json!({"type": "response.function_call_arguments.delta", "item_id": "fc_1", "delta": "}"}),
            json!({"type": "response.function_call_arguments.done", "output_index": 1, "arguments": "{\"x\":1}"}),
            json!({"type": "response.output_item.done", "output_index": 1,
                   "item": {"type": "function_call", "call_id": "call_1", "name": "tool", "arguments": "{\"x\":1}"}}),
            json!({"type": "response.completed", "response": {"status": "completed", "output": [],
                   "usage": {"input_tokens": 5, "output_tokens": 3}}}),
        ]);
        let resp = run(&payload).await;

        assert_eq!(
            resp.content,
            vec![
                ResponseContent::Thinking {
                    thinking: "think".into(),
                    signature: None
                },
                ResponseContent::Text {
                    text: "Hello".into()
                },
                ResponseContent::ToolUse {
                    id: "call_1".into(),
                    name: "tool".into(),
                    input: json!({"x": 1})
                },
            ]
        );
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(resp.usage.output_tokens, 3);
    }

    #[test]
    fn arguments_before_name_are_held() {
        let mut decoder = ResponsesDecoder::new("m");
        let mut out = Vec::new();
        let feed = |decoder: &mut ResponsesDecoder, out: &mut Vec<StreamEvent>, v: Value| {
            decoder.data(&v.to_string(), out).unwrap()
        };
        feed(
            &mut decoder,
            &mut out,
            json!({"type": "response.function_call_arguments.delta", "call_id": "c", "delta": "{}"}),
        );
        assert!(out.is_empty());
        feed(
            &mut decoder,
            &mut out,
            json!({"type": "response.function_call_arguments.done", "call_id": "c", "name": "f", "arguments": "{}"}),
        );
        let deltas: Vec<_> = out
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["{}"]);
    }

    #[tokio::test]
    async fn completed_without_deltas_replays_the_response() {
        let payload = events(&[json!({
            "type": "response.completed",
            "response": {
                "status": "incomplete",
                "incomplete_details": {"reason": "max_output_tokens"},
                "output": [
                    {"type": "reasoning", "summary": [{"type": "summary_text", "text": "why"}]},
                    {"type": "message", "role": "assistant", "content": [{"type": "output_text", "text": "because"}]}
                ]
            }
        })]);
        let resp = run(&payload).await;

        assert_eq!(
            resp.content,
            vec![
                ResponseContent::Thinking {
                    thinking: "why".into(),
                    signature: None
                },
                ResponseContent::Text {
                    text: "because".into()
                },
            ]
        );
        assert_eq!(resp.stop_reason.as_deref(), Some("max_tokens"));
    }

    #[test]
    fn completed_then_done_stops_once() {
        let mut decoder = ResponsesDecoder::new("m");
        let mut out = Vec::new();
        let response = json!({
            "status": "completed",
            "output": [{"type": "message", "role": "assistant",
                        "content": [{"type": "output_text", "text": "once"}]}]
        });
        for kind in ["response.completed", "response.done"] {
            decoder
                .data(&json!({"type": kind, "response": response}).to_string(), &mut out)
                .unwrap();
        }

        let names: Vec<_> = out.iter().map(StreamEvent::name).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn failed_response_surfaces_its_message() {
        let mut decoder = ResponsesDecoder::new("m");
        let err = decoder
            .data(
                &json!({"type": "response.failed", "response": {"error": {"message": "overloaded"}}})
                    .to_string(),
                &mut Vec::new(),
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "overloaded");
    }
}
