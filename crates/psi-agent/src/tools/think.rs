//! Scratchpad tool with no side effects

use async_trait::async_trait;
use psi_ai::ToolResult;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::tool::Tool;

/// Lets the model write down intermediate reasoning. Executes nothing.
pub struct ThinkTool;

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &str {
        "think"
    }

    fn description(&self) -> &str {
        "Record a thought while working through a problem. The thought is not \
         shown to the user and has no side effects."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "thought": {
                    "type": "string",
                    "description": "The thought to record"
                }
            },
            "required": ["thought"]
        })
    }

    async fn execute(&self, _arguments: serde_json::Value, _cancel: CancellationToken) -> ToolResult {
        ToolResult::ok("", "Thought recorded.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psi_ai::ToolStatus;

    #[tokio::test]
    async fn test_think_has_no_side_effects() {
        let result = ThinkTool
            .execute(
                json!({"thought": "the bug is in the parser"}),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Ok);
        assert_eq!(result.output, "Thought recorded.");
    }
}
