//! Chat-provider implementations
//!
//! The core drives any [`crate::ChatProvider`]; this module ships one
//! concrete implementation for OpenAI-compatible chat-completions APIs.

pub mod openai;

pub use openai::OpenAIProvider;
