//! Conversation entries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One rendered item of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationEntry {
    User {
        content: String,
    },
    Assistant {
        content: String,
    },
    /// Message from the secondary agent.
    UserAgent {
        content: String,
    },
    ToolStart {
        invocation_id: String,
        function: String,
        arguments: Value,
    },
    ToolResult {
        invocation_id: String,
        function: String,
        result: Value,
    },
    CodeExecution {
        execution_id: String,
        code: String,
    },
}

impl ConversationEntry {
    /// Approximate in-memory size.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        let payload = match self {
            Self::User { content } | Self::Assistant { content } | Self::UserAgent { content } => {
                content.len()
            }
            Self::ToolStart {
                invocation_id,
                function,
                arguments: data,
            }
            | Self::ToolResult {
                invocation_id,
                function,
                result: data,
            } => invocation_id.len() + function.len() + data.to_string().len(),
            Self::CodeExecution { execution_id, code } => execution_id.len() + code.len(),
        };
        OVERHEAD + payload
    }
}
