//! Core types for the conversation data model
//!
//! Messages and their content parts are immutable once created; the same
//! shapes are written verbatim to the history file, one JSON object per
//! line, so every field here is part of the on-disk format.

use serde::{Deserialize, Serialize};

/// Message roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// Outcome classification of a tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ToolStatus {
    Ok,
    Error,
    Rejected,
}

/// The function half of a tool call, provider-native: `arguments` is the
/// raw JSON string exactly as the model emitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// One fragment of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text
    Text { text: String },
    /// Tool invocation requested by the model
    ToolCall { id: String, function: FunctionCall },
    /// Result of a tool invocation
    ToolResult {
        call_id: String,
        status: ToolStatus,
        message: String,
        output: String,
    },
}

impl ContentPart {
    /// Create a text part
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a tool-call part
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::ToolCall {
            id: id.into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Get text if this is a text part
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Check if this is a tool call
    pub fn is_tool_call(&self) -> bool {
        matches!(self, Self::ToolCall { .. })
    }
}

/// A message in the conversation history.
///
/// Immutable once appended; positional index in the history is its
/// identity within the current generation of the history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl Message {
    /// Create a user message with a single text part
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentPart::text(text)],
        }
    }

    /// Create a system message with a single text part
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentPart::text(text)],
        }
    }

    /// Create an assistant message from content parts
    pub fn assistant(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    /// Create a tool-role message from tool-result parts
    pub fn tool(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::Tool,
            content,
        }
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool calls as `(id, name, arguments)` triples
    pub fn tool_calls(&self) -> Vec<(&str, &str, &str)> {
        self.content
            .iter()
            .filter_map(|c| match c {
                ContentPart::ToolCall { id, function } => {
                    Some((id.as_str(), function.name.as_str(), function.arguments.as_str()))
                }
                _ => None,
            })
            .collect()
    }

    /// Whether the message carries any tool calls
    pub fn has_tool_calls(&self) -> bool {
        self.content.iter().any(ContentPart::is_tool_call)
    }
}

/// Tool definition handed to the model for function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name (used in API calls)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for the arguments object
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Result of a tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub status: ToolStatus,
    /// Short human-readable summary, truncated at dispatch
    pub message: String,
    /// Payload returned to the model
    pub output: String,
}

impl ToolResult {
    /// Create a successful result
    pub fn ok(message: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Ok,
            message: message.into(),
            output: output.into(),
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            message: message.into(),
            output: String::new(),
        }
    }

    /// Create a rejected result
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Rejected,
            message: message.into(),
            output: String::new(),
        }
    }

    /// Whether the execution failed
    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    /// Convert into a tool-result content part for the given call
    pub fn into_part(self, call_id: impl Into<String>) -> ContentPart {
        ContentPart::ToolResult {
            call_id: call_id.into(),
            status: self.status,
            message: self.message,
            output: self.output,
        }
    }
}
