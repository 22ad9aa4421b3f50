//! psi-ai: Chat-provider abstraction for the psi agent runtime
//!
//! This crate defines the conversation data model, the streaming chunk
//! contract a chat provider must honour, and the facade that assembles
//! raw chunks into fully-formed assistant output.

pub mod error;
pub mod llm;
pub mod providers;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use llm::{ChatProvider, CompletionEvent, CompletionStream, Llm};
pub use stream::{AssistantOutput, Chunk, ChunkStream, OutputBuilder};
pub use types::*;
