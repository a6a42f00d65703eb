//! LLM transport seam. Pure API call: request in, response out. Context
//! assembly happens upstream; the transport only encodes and decodes.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::Sender;

use crate::conversation::{ContentPart, Message, Role};
use crate::error::TransportError;

/// Fully-formed request — the transport just sends it.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Option<String>,
    pub tools: Vec<Value>,
    pub messages: Vec<Message>,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Token usage for a single call.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub stop_reason: StopReason,
    pub output: Vec<ContentPart>,
    pub usage: Usage,
}

/// Streaming events. Finite, non-restartable, terminated by `Done`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta { text: String },
    ToolUseStart { id: String, name: String },
    Done,
}

#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn run(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    /// Default streaming: one blocking run, replayed as events. Real
    /// transports override this with wire-level streaming.
    async fn stream(
        &self,
        request: TransportRequest,
        tx: Sender<StreamEvent>,
    ) -> Result<TransportResponse, TransportError> {
        let response = self.run(request).await?;
        for part in &response.output {
            match part {
                ContentPart::OutputText { text } => {
                    let _ = tx.send(StreamEvent::TextDelta { text: text.clone() }).await;
                }
                ContentPart::ToolUse { id, name, .. } => {
                    let _ = tx
                        .send(StreamEvent::ToolUseStart {
                            id: id.clone(),
                            name: name.clone(),
                        })
                        .await;
                }
                _ => {}
            }
        }
        let _ = tx.send(StreamEvent::Done).await;
        Ok(response)
    }
}

/// Encode typed messages into Anthropic messages-API JSON. Developer
/// messages ride as user turns — the system string travels separately.
pub fn to_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let role = match msg.role {
                Role::Assistant => "assistant",
                Role::User | Role::Developer => "user",
            };
            let content: Vec<Value> = msg.parts.iter().map(part_to_wire).collect();
            json!({ "role": role, "content": content })
        })
        .collect()
}

fn part_to_wire(part: &ContentPart) -> Value {
    match part {
        ContentPart::InputText { text } | ContentPart::OutputText { text } => {
            json!({ "type": "text", "text": text })
        }
        ContentPart::ToolUse { id, name, input } => {
            json!({ "type": "tool_use", "id": id, "name": name, "input": input })
        }
        ContentPart::ToolResult {
            tool_use_id,
            content,
            error,
        } => {
            let mut block = json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            });
            if error.is_some() {
                block["is_error"] = json!(true);
            }
            block
        }
        ContentPart::ImageUrl { url, .. } => {
            json!({ "type": "image", "source": { "type": "url", "url": url } })
        }
    }
}

/// Claude API client via Anthropic's messages endpoint.
pub struct AnthropicTransport {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl LlmTransport for AnthropicTransport {
    async fn run(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": to_wire_messages(&request.messages),
        });
        if let Some(ref system) = request.system {
            body["system"] = Value::String(system.clone());
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools);
        }

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        if status != 200 {
            return Err(TransportError::Api { status, body: text });
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| TransportError::Parse(e.to_string()))?;
        parse_response(&parsed)
    }
}

fn parse_response(body: &Value) -> Result<TransportResponse, TransportError> {
    let mut output = Vec::new();
    let content = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| TransportError::Parse("response missing content array".into()))?;

    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = block
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::Parse("text block without text".into()))?;
                output.push(ContentPart::OutputText { text: text.into() });
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::Parse("tool_use block without id".into()))?;
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TransportError::Parse("tool_use block without name".into()))?;
                output.push(ContentPart::ToolUse {
                    id: id.into(),
                    name: name.into(),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                });
            }
            // Thinking and other block kinds are dropped; they never enter
            // the conversation.
            _ => {}
        }
    }

    let stop_reason = match body.get("stop_reason").and_then(Value::as_str) {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };

    let usage = Usage {
        input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
        output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
    };

    Ok(TransportResponse {
        stop_reason,
        output,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_encoding_maps_roles_and_parts() {
        let messages = vec![
            Message::user_text("hello"),
            Message::assistant(vec![ContentPart::ToolUse {
                id: "t1".into(),
                name: "search".into(),
                input: json!({"q": "x"}),
            }]),
            Message::tool_results(vec![ContentPart::ToolResult {
                tool_use_id: "t1".into(),
                content: "found".into(),
                error: Some("timeout".into()),
            }]),
        ];

        let wire = to_wire_messages(&messages);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "text");
        assert_eq!(wire[1]["role"], "assistant");
        assert_eq!(wire[1]["content"][0]["type"], "tool_use");
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["is_error"], true);
    }

    #[test]
    fn parse_response_text_and_tools() {
        let body = json!({
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "c1", "name": "search", "input": {"q": "rust"}},
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 34},
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.output.len(), 2);
        assert_eq!(resp.usage.input_tokens, 12);
        match &resp.output[1] {
            ContentPart::ToolUse { name, .. } => assert_eq!(name, "search"),
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[test]
    fn parse_response_rejects_missing_content() {
        let err = parse_response(&json!({"stop_reason": "end_turn"})).unwrap_err();
        assert!(matches!(err, TransportError::Parse(_)));
    }

    #[tokio::test]
    async fn default_stream_replays_run() {
        struct OneShot;

        #[async_trait]
        impl LlmTransport for OneShot {
            async fn run(
                &self,
                _request: TransportRequest,
            ) -> Result<TransportResponse, TransportError> {
                Ok(TransportResponse {
                    stop_reason: StopReason::EndTurn,
                    output: vec![ContentPart::OutputText { text: "hi".into() }],
                    usage: Usage::default(),
                })
            }
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let request = TransportRequest {
            model: "m".into(),
            max_tokens: 16,
            system: None,
            tools: vec![],
            messages: vec![],
        };
        OneShot.stream(request, tx).await.unwrap();

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert!(matches!(events[0], StreamEvent::TextDelta { .. }));
        assert!(matches!(events.last().unwrap(), StreamEvent::Done));
    }
}
