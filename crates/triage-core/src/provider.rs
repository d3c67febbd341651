use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::messages::{AssistantMessage, Message, ToolCallBlock};
use crate::tools::ToolDefinition;

/// One request to the model capability.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// What the model answered: either a final text or a batch of tool calls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Completion {
    Final {
        text: String,
    },
    ToolCalls {
        #[serde(default)]
        text: String,
        calls: Vec<ToolCallBlock>,
    },
}

impl Completion {
    pub fn text(&self) -> &str {
        match self {
            Completion::Final { text } | Completion::ToolCalls { text, .. } => text,
        }
    }

    pub fn to_message(&self) -> AssistantMessage {
        match self {
            Completion::Final { text } => AssistantMessage::text(text.clone()),
            Completion::ToolCalls { text, calls } => AssistantMessage {
                text: text.clone(),
                tool_calls: calls.clone(),
            },
        }
    }
}

/// Trait implemented by each model backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ToolCallId;

    #[test]
    fn completion_tagged_serde() {
        let c = Completion::Final { text: "hi".into() };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "final");

        let c = Completion::ToolCalls {
            text: String::new(),
            calls: vec![ToolCallBlock {
                id: ToolCallId::from_raw("call_1"),
                name: "analyze_screenshot".into(),
                arguments: serde_json::json!({"url": "a.png"}),
            }],
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "tool_calls");
        assert_eq!(json["calls"][0]["name"], "analyze_screenshot");
    }

    #[test]
    fn to_message_carries_calls() {
        let c = Completion::ToolCalls {
            text: "checking".into(),
            calls: vec![ToolCallBlock {
                id: ToolCallId::new(),
                name: "x".into(),
                arguments: serde_json::Value::Null,
            }],
        };
        let m = c.to_message();
        assert_eq!(m.text, "checking");
        assert_eq!(m.tool_calls.len(), 1);
        assert_eq!(c.text(), "checking");
    }
}
