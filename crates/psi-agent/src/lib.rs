//! psi-agent: the agent runtime core
//!
//! This crate drives a multi-turn LLM conversation through repeated
//! rounds of completion and tool execution, persists every turn to a
//! crash-safe JSONL history with checkpoint-based rollback, and fans
//! loop progress out to any number of subscribers.

pub mod approval;
pub mod compaction;
pub mod context;
pub mod dmail;
pub mod error;
pub mod events;
pub mod registry;
pub mod session;
pub mod soul;
pub mod tool;
pub mod tools;
pub mod wire;

pub use approval::{Approval, ApprovalResponse, PendingApproval};
pub use compaction::{CompactionConfig, CompactionStrategy, LlmCompaction};
pub use context::{Context, HistoryRecord, MetaRecord};
pub use dmail::{DMail, DMailBox};
pub use error::{Error, Result};
pub use events::SoulEvent;
pub use registry::ToolRegistry;
pub use session::Session;
pub use soul::{RunOutcome, Soul, SoulConfig, SoulHandle};
pub use tool::{BoxedTool, Tool};
pub use wire::{Wire, WireSubscription};
