//! Context compaction
//!
//! When the model-reported token count crosses the configured share of the
//! context window, the driver summarizes the history prefix preceding the
//! most recent checkpoint and replaces it with a single assistant message.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use psi_ai::{CompletionEvent, ContentPart, Llm, Message, Role, ToolStatus};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Compaction policy knobs
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Whether automatic compaction runs between steps
    pub enabled: bool,
    /// Fraction of the context window that triggers compaction, in (0, 1)
    pub ratio: f64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ratio: 0.75,
        }
    }
}

/// Produces the replacement summary for a history prefix
#[async_trait]
pub trait CompactionStrategy: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String>;
}

const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
You are a specialized summarization model. Your task is to create a comprehensive \
yet concise summary of a coding conversation. This summary will replace the original \
messages in the conversation context, so it must capture all essential information \
needed to continue the conversation effectively.";

const SUMMARIZATION_PROMPT: &str = "\
Please provide a detailed summary of this conversation so far. The summary should:

1. **Goal**: What is the user's primary objective?
2. **Progress**: What has been accomplished so far? List specific changes made.
3. **Key Decisions**: What important technical decisions were made and why?
4. **Next Steps**: What was the user about to do or ask about next?
5. **Critical Context**: Any important constraints, preferences, or context that would be lost.

Format your response as a structured summary using the headers above. Be thorough but concise.

<conversation>
{conversation}
</conversation>";

/// Summarizes the prefix with the session's own model
pub struct LlmCompaction {
    llm: Arc<Llm>,
}

impl LlmCompaction {
    pub fn new(llm: Arc<Llm>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl CompactionStrategy for LlmCompaction {
    async fn summarize(&self, messages: &[Message]) -> Result<String> {
        let conversation = render_for_summary(messages);
        let prompt = SUMMARIZATION_PROMPT.replace("{conversation}", &conversation);

        let history = vec![
            Message::system(SUMMARIZATION_SYSTEM_PROMPT),
            Message::user(prompt),
        ];

        let mut stream = self
            .llm
            .complete(history, vec![], CancellationToken::new())
            .await
            .map_err(|e| Error::Compaction(format!("summarization call failed: {e}")))?;

        let mut summary = String::new();
        while let Some(event) = stream.next().await {
            match event {
                CompletionEvent::Finished(output) => {
                    summary = output
                        .parts
                        .iter()
                        .filter_map(ContentPart::as_text)
                        .collect::<Vec<_>>()
                        .join("");
                }
                CompletionEvent::Error { message } => {
                    return Err(Error::Compaction(format!("summarization failed: {message}")));
                }
                CompletionEvent::Part(_) => {}
            }
        }

        if summary.trim().is_empty() {
            return Err(Error::Compaction(
                "summarization returned an empty response".to_string(),
            ));
        }
        Ok(summary)
    }
}

/// Render messages as readable text so the summarization model does not
/// try to continue the conversation.
fn render_for_summary(messages: &[Message]) -> String {
    let mut out = String::new();

    for msg in messages {
        match msg.role {
            Role::User | Role::System => {
                let text = msg.text();
                if !text.is_empty() {
                    out.push_str("[User]: ");
                    out.push_str(&text);
                    out.push('\n');
                }
            }
            Role::Assistant => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();

                for part in &msg.content {
                    match part {
                        ContentPart::Text { text } => text_parts.push(text.as_str()),
                        ContentPart::ToolCall { function, .. } => {
                            tool_calls.push(format!("{}({})", function.name, function.arguments));
                        }
                        ContentPart::ToolResult { .. } => {}
                    }
                }

                if !text_parts.is_empty() {
                    out.push_str("[Assistant]: ");
                    out.push_str(&text_parts.join(""));
                    out.push('\n');
                }
                if !tool_calls.is_empty() {
                    out.push_str("[Assistant tool calls]: ");
                    out.push_str(&tool_calls.join("; "));
                    out.push('\n');
                }
            }
            Role::Tool => {
                for part in &msg.content {
                    if let ContentPart::ToolResult {
                        call_id,
                        status,
                        output,
                        ..
                    } = part
                    {
                        let label = if *status == ToolStatus::Ok {
                            format!("[Tool result ({call_id})]: ")
                        } else {
                            format!("[Tool error ({call_id})]: ")
                        };
                        out.push_str(&label);
                        if output.len() > 2000 {
                            // back off to a char boundary; outputs carry arbitrary UTF-8
                            let mut end = 2000;
                            while !output.is_char_boundary(end) {
                                end -= 1;
                            }
                            out.push_str(&output[..end]);
                            out.push_str("...(truncated)");
                        } else {
                            out.push_str(output);
                        }
                        out.push('\n');
                    }
                }
            }
        }
    }

    out
}
