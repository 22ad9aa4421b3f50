//! Loop progress events published on the wire

use std::collections::BTreeMap;

use psi_ai::{ContentPart, ToolResult};
use serde::{Deserialize, Serialize};

/// Events emitted while the loop driver runs.
///
/// Serializable as-is so front-ends can forward them over any transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SoulEvent {
    /// A new step started
    StepBegin { step: u32 },

    /// The current step was interrupted (cancellation or max-steps)
    StepInterrupted,

    /// The run produced its terminal response
    StepEnd,

    /// Context compaction started
    CompactionBegin,

    /// Context compaction completed
    CompactionEnd,

    /// A fully-assembled assistant content part
    ContentPart { part: ContentPart },

    /// The model requested a tool invocation
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },

    /// A tool invocation finished
    ToolResult {
        call_id: String,
        result: ToolResult,
    },

    /// Free-form informational status for the host
    StatusUpdate { status: BTreeMap<String, String> },
}
