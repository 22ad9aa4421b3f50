//! Tool registry and dispatch pipeline

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use psi_ai::{ToolResult, ToolSpec};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::tool::{to_spec, BoxedTool};

/// Result messages longer than this are truncated at dispatch
const MAX_RESULT_MESSAGE_CHARS: usize = 500;

/// Holds the tool table and runs the dispatch pipeline: lookup, argument
/// decoding against the tool's schema, execution, result normalization.
/// Approval is the tool body's concern, not the registry's.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<BoxedTool>,
    index: HashMap<String, usize>,
    validators: HashMap<String, Arc<jsonschema::Validator>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Duplicate names are rejected.
    pub fn register(&mut self, tool: BoxedTool) -> Result<()> {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(Error::DuplicateTool(name));
        }
        match jsonschema::validator_for(&tool.parameters_schema()) {
            Ok(validator) => {
                self.validators.insert(name.clone(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    name,
                    e
                );
            }
        }
        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Ordered tool specs for the LLM
    pub fn catalog(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| to_spec(t.as_ref())).collect()
    }

    /// Set of registered tool names
    pub fn names(&self) -> HashSet<String> {
        self.index.keys().cloned().collect()
    }

    /// Look up a tool by name
    pub fn get(&self, name: &str) -> Option<&BoxedTool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Dispatch one tool call: `arguments` is the raw JSON string the
    /// model emitted. Never fails; every failure mode becomes a
    /// [`ToolResult`] the model can react to.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: &str,
        cancel: CancellationToken,
    ) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return normalize(ToolResult::error(format!("unknown tool: {name}")));
        };

        let parsed: serde_json::Value = if arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str(arguments) {
                Ok(value) => value,
                Err(e) => {
                    return normalize(ToolResult::error(format!("invalid arguments: {e}")));
                }
            }
        };

        if let Some(validator) = self.validators.get(name) {
            if let Some(message) = validation_errors(&parsed, validator) {
                return normalize(ToolResult::error(format!("invalid arguments: {message}")));
            }
        }

        // run on a separate task so a panicking tool body surfaces as an
        // error result instead of tearing down the loop
        let tool = Arc::clone(tool);
        let handle = tokio::spawn(async move { tool.execute(parsed, cancel).await });
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => ToolResult::error(format!("tool failed: {e}")),
        };

        normalize(result)
    }
}

/// Clamp the human-readable message; the model-facing output is passed
/// through unchanged.
fn normalize(mut result: ToolResult) -> ToolResult {
    if result.message.chars().count() > MAX_RESULT_MESSAGE_CHARS {
        let truncated: String = result.message.chars().take(MAX_RESULT_MESSAGE_CHARS).collect();
        result.message = format!("{truncated}…");
    }
    result
}

/// Collect validation errors, `None` if the arguments are valid
fn validation_errors(args: &serde_json::Value, validator: &jsonschema::Validator) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(errors.join("; "))
    }
}
