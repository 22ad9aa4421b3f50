//! Tool that lets the model send a D-Mail

use async_trait::async_trait;
use psi_ai::ToolResult;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::dmail::DMailBox;
use crate::tool::Tool;

#[derive(Debug, Deserialize)]
struct SendDMailParams {
    checkpoint_id: u32,
    message: String,
}

/// Requests a revert to an earlier checkpoint with a replacement user
/// message. The driver honours the request between steps.
pub struct SendDMailTool {
    mailbox: DMailBox,
}

impl SendDMailTool {
    pub fn new(mailbox: DMailBox) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl Tool for SendDMailTool {
    fn name(&self) -> &str {
        "send_dmail"
    }

    fn description(&self) -> &str {
        "Send a message back to a previous checkpoint. The conversation is rewound \
         to that checkpoint and continues from the given message instead. Use this \
         to undo a line of work that turned out to be a dead end."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "checkpoint_id": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Id of the checkpoint to rewind to"
                },
                "message": {
                    "type": "string",
                    "description": "The user message to continue from after the rewind"
                }
            },
            "required": ["checkpoint_id", "message"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value, _cancel: CancellationToken) -> ToolResult {
        let params: SendDMailParams = match serde_json::from_value(arguments) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(format!("invalid arguments: {e}")),
        };

        if self.mailbox.send(params.checkpoint_id, params.message) {
            ToolResult::ok(
                format!("D-Mail sent to checkpoint {}", params.checkpoint_id),
                "D-Mail accepted; the conversation will rewind before the next step.",
            )
        } else {
            ToolResult::error(format!(
                "D-Mail rejected: checkpoint {} does not exist or a D-Mail is already pending",
                params.checkpoint_id
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psi_ai::ToolStatus;

    #[tokio::test]
    async fn test_send_to_valid_checkpoint() {
        let mailbox = DMailBox::new();
        mailbox.set_checkpoint_count(2);
        let tool = SendDMailTool::new(mailbox.clone());

        let result = tool
            .execute(
                json!({"checkpoint_id": 1, "message": "try again"}),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Ok);

        let mail = mailbox.fetch().unwrap();
        assert_eq!(mail.checkpoint_id, 1);
        assert_eq!(mail.message, "try again");
    }

    #[tokio::test]
    async fn test_send_to_missing_checkpoint() {
        let tool = SendDMailTool::new(DMailBox::new());
        let result = tool
            .execute(
                json!({"checkpoint_id": 0, "message": "nope"}),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.status, ToolStatus::Error);
    }
}
