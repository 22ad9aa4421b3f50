//! Tool trait

use std::sync::Arc;

use async_trait::async_trait;
use psi_ai::{ToolResult, ToolSpec};
use tokio_util::sync::CancellationToken;

/// A named, schema-bound callable invocable by the model.
///
/// Dispatch is by registry lookup; a tool whose execution has side effects
/// is responsible for consulting the approval gate itself.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> &str;

    /// JSON Schema for the arguments object
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute with schema-validated arguments
    async fn execute(&self, arguments: serde_json::Value, cancel: CancellationToken) -> ToolResult;
}

/// Type alias for a shared tool
pub type BoxedTool = Arc<dyn Tool>;

/// Convert a tool to the spec handed to the LLM
pub fn to_spec(tool: &dyn Tool) -> ToolSpec {
    ToolSpec {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    }
}
