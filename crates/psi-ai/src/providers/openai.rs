//! OpenAI-compatible chat-completions streaming provider

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::llm::ChatProvider;
use crate::stream::{Chunk, ChunkStream};
use crate::types::{ContentPart, Message, Role, ToolSpec};

/// Client for any chat-completions endpoint speaking the OpenAI wire format
pub struct OpenAIProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAIProvider {
    /// Create a provider for the given endpoint and model.
    ///
    /// The core reads no environment variables; callers resolve base URL,
    /// key, and model themselves.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn build_request(&self, history: &[Message], tool_specs: &[ToolSpec]) -> ChatRequest {
        let mut messages = Vec::new();
        for msg in history {
            messages.extend(convert_message(msg));
        }

        let tools = if tool_specs.is_empty() {
            None
        } else {
            Some(
                tool_specs
                    .iter()
                    .map(|t| WireTool {
                        tool_type: "function".to_string(),
                        function: WireFunction {
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: Some(t.parameters.clone()),
                        },
                    })
                    .collect(),
            )
        };

        ChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            tools,
        }
    }
}

#[async_trait]
impl ChatProvider for OpenAIProvider {
    async fn stream(
        &self,
        history: &[Message],
        tool_specs: &[ToolSpec],
        cancel: CancellationToken,
    ) -> Result<ChunkStream> {
        if self.api_key.is_empty() {
            return Err(Error::InvalidApiKey);
        }

        let request = self.build_request(history, tool_specs);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let request_builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&request);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {e}")))?;

        Ok(Box::pin(create_stream(event_source, cancel)))
    }
}

fn convert_message(msg: &Message) -> Vec<WireMessage> {
    match msg.role {
        Role::User | Role::System => {
            vec![WireMessage {
                role: if msg.role == Role::System {
                    "system"
                } else {
                    "user"
                }
                .to_string(),
                content: Some(msg.text()),
                tool_calls: None,
                tool_call_id: None,
            }]
        }
        Role::Assistant => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();

            for part in &msg.content {
                match part {
                    ContentPart::Text { text } => text_parts.push(text.clone()),
                    ContentPart::ToolCall { id, function } => {
                        tool_calls.push(WireToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: WireFunctionCall {
                                name: function.name.clone(),
                                arguments: function.arguments.clone(),
                            },
                        });
                    }
                    ContentPart::ToolResult { .. } => {}
                }
            }

            vec![WireMessage {
                role: "assistant".to_string(),
                content: if text_parts.is_empty() {
                    None
                } else {
                    Some(text_parts.join(""))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            }]
        }
        // one wire message per tool-result part, keyed by tool_call_id
        Role::Tool => msg
            .content
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult {
                    call_id, output, ..
                } => Some(WireMessage {
                    role: "tool".to_string(),
                    content: Some(output.clone()),
                    tool_calls: None,
                    tool_call_id: Some(call_id.clone()),
                }),
                _ => None,
            })
            .collect(),
    }
}

fn create_stream(
    mut event_source: EventSource,
    cancel: CancellationToken,
) -> impl futures::Stream<Item = Result<Chunk>> {
    stream! {
        while let Some(event) = event_source.next().await {
            if cancel.is_cancelled() {
                return;
            }
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        yield Ok(Chunk::Done);
                        return;
                    }

                    let parsed: std::result::Result<StreamChunk, _> =
                        serde_json::from_str(&msg.data);
                    let parsed = match parsed {
                        Ok(p) => p,
                        Err(e) => {
                            yield Err(Error::Sse(format!("Failed to parse chunk: {e}")));
                            return;
                        }
                    };

                    for choice in &parsed.choices {
                        if let Some(ref content) = choice.delta.content {
                            if !content.is_empty() {
                                yield Ok(Chunk::TextDelta(content.clone()));
                            }
                        }
                        if let Some(ref tool_calls) = choice.delta.tool_calls {
                            for tc in tool_calls {
                                yield Ok(Chunk::ToolCallDelta {
                                    index: tc.index as usize,
                                    id: tc.id.clone(),
                                    name: tc.function.as_ref().and_then(|f| f.name.clone()),
                                    arguments_delta: tc
                                        .function
                                        .as_ref()
                                        .and_then(|f| f.arguments.clone()),
                                });
                            }
                        }
                    }

                    // usage arrives in the final data chunk before [DONE]
                    if let Some(ref usage) = parsed.usage {
                        yield Ok(Chunk::Usage {
                            tokens: u64::from(usage.prompt_tokens + usage.completion_tokens),
                        });
                    }
                }
                Err(reqwest_eventsource::Error::StreamEnded) => {
                    yield Ok(Chunk::Done);
                    return;
                }
                Err(e) => {
                    yield Err(Error::Sse(format!("SSE error: {e}")));
                    return;
                }
            }
        }
        yield Ok(Chunk::Done);
    }
}

// Request/response wire types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolResult;

    #[test]
    fn test_assistant_tool_calls_serialized_stringly() {
        let msg = Message::assistant(vec![ContentPart::tool_call(
            "t1",
            "grep",
            r#"{"pattern":"fn main"}"#,
        )]);
        let wire = convert_message(&msg);
        assert_eq!(wire.len(), 1);
        let calls = wire[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"pattern":"fn main"}"#);
        assert!(wire[0].content.is_none());
    }

    #[test]
    fn test_tool_role_fans_out_per_result() {
        let msg = Message::tool(vec![
            ToolResult::ok("", "a").into_part("t1"),
            ToolResult::error("boom").into_part("t2"),
        ]);
        let wire = convert_message(&msg);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].tool_call_id.as_deref(), Some("t1"));
        assert_eq!(wire[0].content.as_deref(), Some("a"));
        assert_eq!(wire[1].tool_call_id.as_deref(), Some("t2"));
    }

    #[test]
    fn test_system_role_maps_to_system() {
        let wire = convert_message(&Message::system("be brief"));
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[0].content.as_deref(), Some("be brief"));
    }
}
