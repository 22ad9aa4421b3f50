//! LLM facade: wraps a chat provider and yields assembled completions

use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::stream::{AssistantOutput, Chunk, ChunkStream, OutputBuilder};
use crate::types::{ContentPart, Message, ToolSpec};

/// Contract a chat provider must honour.
///
/// Providers are swappable; the facade does no provider-specific retry.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Stream a completion for the given history and tool catalog.
    async fn stream(
        &self,
        history: &[Message],
        tool_specs: &[ToolSpec],
        cancel: CancellationToken,
    ) -> Result<ChunkStream>;
}

/// Events yielded by [`Llm::complete`]: zero or more finalized parts in
/// emission order, then exactly one terminal `Finished` or `Error`.
#[derive(Debug)]
pub enum CompletionEvent {
    /// A fully-assembled content part
    Part(ContentPart),
    /// Terminal: the completed (or interrupted) assistant output
    Finished(AssistantOutput),
    /// Terminal: the provider or the chunk sequence failed
    Error { message: String },
}

/// A stream of completion events
pub type CompletionStream = Pin<Box<dyn Stream<Item = CompletionEvent> + Send>>;

/// Facade over a chat provider
pub struct Llm {
    provider: Arc<dyn ChatProvider>,
    max_context_size: u64,
}

impl Llm {
    pub fn new(provider: Arc<dyn ChatProvider>, max_context_size: u64) -> Self {
        Self {
            provider,
            max_context_size,
        }
    }

    /// Context window size of the underlying model, in tokens
    pub fn max_context_size(&self) -> u64 {
        self.max_context_size
    }

    /// Stream a completion, assembling chunks into content parts.
    ///
    /// Cancellation aborts the stream promptly: the terminal event is then
    /// `Finished` with `interrupted = true` carrying the parts that were
    /// fully assembled before the signal.
    pub async fn complete(
        &self,
        history: Vec<Message>,
        tool_specs: Vec<ToolSpec>,
        cancel: CancellationToken,
    ) -> Result<CompletionStream> {
        let mut chunks = self
            .provider
            .stream(&history, &tool_specs, cancel.clone())
            .await?;

        let events = stream! {
            let mut builder = OutputBuilder::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    chunk = chunks.next() => Some(chunk),
                };
                let Some(chunk) = next else {
                    // cancelled: return whatever was fully assembled
                    match builder.finish(true) {
                        Ok(output) => yield CompletionEvent::Finished(output),
                        Err(e) => yield CompletionEvent::Error { message: e.to_string() },
                    }
                    return;
                };

                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        yield CompletionEvent::Error { message: e.to_string() };
                        return;
                    }
                    // provider ended without Done: treat as complete
                    None => Chunk::Done,
                };
                let terminal = chunk == Chunk::Done;

                match builder.push(chunk) {
                    Ok(parts) => {
                        for part in parts {
                            yield CompletionEvent::Part(part);
                        }
                    }
                    Err(e) => {
                        yield CompletionEvent::Error { message: e.to_string() };
                        return;
                    }
                }

                if terminal {
                    match builder.finish(false) {
                        Ok(output) => yield CompletionEvent::Finished(output),
                        Err(e) => yield CompletionEvent::Error { message: e.to_string() },
                    }
                    return;
                }
            }
        };

        Ok(Box::pin(events))
    }
}
