//! Streaming chunk types and assistant-output assembly

use std::collections::HashSet;
use std::pin::Pin;

use tokio_stream::Stream;

use crate::error::{Error, Result};
use crate::types::{ContentPart, FunctionCall};

/// One fragment of a streamed completion as produced by a chat provider
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    /// Text delta for the current text part
    TextDelta(String),
    /// Fragment of a tool call, routed by provider-assigned index
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: Option<String>,
    },
    /// Model-reported token usage for the whole context window
    Usage { tokens: u64 },
    /// End of stream
    Done,
}

/// A stream of chunks from a provider
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk>> + Send>>;

/// Fully-assembled assistant output for one completion
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantOutput {
    /// Content parts in emission order
    pub parts: Vec<ContentPart>,
    /// Model-reported token count, 0 if the provider never reported usage
    pub token_count: u64,
    /// Whether the stream was cancelled before completion
    pub interrupted: bool,
}

impl AssistantOutput {
    /// Whether any part is a tool call
    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(ContentPart::is_tool_call)
    }
}

#[derive(Debug)]
struct PartialCall {
    index: usize,
    id: String,
    name: String,
    arguments: String,
}

/// Assembles provider chunks into ordered content parts.
///
/// Text deltas accumulate into the open text part; tool-call deltas latch
/// `id`/`name` on first occurrence and concatenate `arguments_delta`. The
/// provider must emit fragments monotonically by index per tool call:
/// re-latching a different id or name, or returning to an index that was
/// already finalized, is a hard error.
#[derive(Debug, Default)]
pub struct OutputBuilder {
    parts: Vec<ContentPart>,
    text: Option<String>,
    call: Option<PartialCall>,
    finished_indices: HashSet<usize>,
    token_count: u64,
}

impl OutputBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one chunk, returning any content parts it finalized.
    pub fn push(&mut self, chunk: Chunk) -> Result<Vec<ContentPart>> {
        let mut done = Vec::new();
        match chunk {
            Chunk::TextDelta(delta) => {
                if let Some(part) = self.flush_call()? {
                    done.push(part);
                }
                self.text.get_or_insert_with(String::new).push_str(&delta);
            }
            Chunk::ToolCallDelta {
                index,
                id,
                name,
                arguments_delta,
            } => {
                if let Some(part) = self.flush_text() {
                    done.push(part);
                }
                if self.call.as_ref().is_some_and(|c| c.index != index) {
                    if let Some(part) = self.flush_call()? {
                        done.push(part);
                    }
                }
                if self.finished_indices.contains(&index) {
                    return Err(Error::Stream(format!(
                        "tool-call fragment for already-finalized index {index}"
                    )));
                }
                let call = self.call.get_or_insert_with(|| PartialCall {
                    index,
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
                if let Some(id) = id {
                    if !call.id.is_empty() && call.id != id {
                        return Err(Error::Stream(format!(
                            "conflicting tool-call id at index {index}: {} vs {id}",
                            call.id
                        )));
                    }
                    call.id = id;
                }
                if let Some(name) = name {
                    if !call.name.is_empty() && call.name != name {
                        return Err(Error::Stream(format!(
                            "conflicting tool-call name at index {index}: {} vs {name}",
                            call.name
                        )));
                    }
                    call.name = name;
                }
                if let Some(delta) = arguments_delta {
                    call.arguments.push_str(&delta);
                }
            }
            Chunk::Usage { tokens } => {
                self.token_count = tokens;
            }
            Chunk::Done => {
                done.extend(self.flush_all()?);
            }
        }
        Ok(done)
    }

    /// Finalize any open parts and build the output.
    ///
    /// An open tool call with a missing id or name is dropped when the
    /// stream was interrupted (the fragment never completed) and is an
    /// error otherwise.
    pub fn finish(mut self, interrupted: bool) -> Result<AssistantOutput> {
        // flush_all appends to self.parts as a side effect
        match self.flush_all() {
            Ok(_) => {}
            Err(e) if !interrupted => return Err(e),
            Err(_) => {}
        }
        Ok(AssistantOutput {
            parts: self.parts,
            token_count: self.token_count,
            interrupted,
        })
    }

    fn flush_text(&mut self) -> Option<ContentPart> {
        let text = self.text.take()?;
        let part = ContentPart::Text { text };
        self.parts.push(part.clone());
        Some(part)
    }

    fn flush_call(&mut self) -> Result<Option<ContentPart>> {
        let Some(call) = self.call.take() else {
            return Ok(None);
        };
        if call.id.is_empty() || call.name.is_empty() {
            return Err(Error::Stream(format!(
                "tool call at index {} never received an id and name",
                call.index
            )));
        }
        self.finished_indices.insert(call.index);
        let part = ContentPart::ToolCall {
            id: call.id,
            function: FunctionCall {
                name: call.name,
                arguments: call.arguments,
            },
        };
        self.parts.push(part.clone());
        Ok(Some(part))
    }

    fn flush_all(&mut self) -> Result<Vec<ContentPart>> {
        let mut done = Vec::new();
        if let Some(part) = self.flush_text() {
            done.push(part);
        }
        if let Some(part) = self.flush_call()? {
            done.push(part);
        }
        Ok(done)
    }
}
