use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "user")]
    User(UserMessage),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "tool_result")]
    ToolResult(ToolResultMessage),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallBlock>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: ToolCallId,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallBlock {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

// --- Convenience constructors ---

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message::User(UserMessage { text: text.into() })
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Message::Assistant(AssistantMessage {
            text: text.into(),
            tool_calls: Vec::new(),
        })
    }

    pub fn tool_result(tool_call_id: ToolCallId, content: impl Into<String>, is_error: bool) -> Self {
        Message::ToolResult(ToolResultMessage {
            tool_call_id,
            content: content.into(),
            is_error,
        })
    }

    /// Number of characters carried by this message, used for token estimates.
    pub fn char_len(&self) -> usize {
        match self {
            Message::User(m) => m.text.chars().count(),
            Message::Assistant(m) => {
                m.text.chars().count()
                    + m.tool_calls
                        .iter()
                        .map(|c| c.name.len() + c.arguments.to_string().len())
                        .sum::<usize>()
            }
            Message::ToolResult(m) => m.content.chars().count(),
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Message::ToolResult(_))
    }

    pub fn has_tool_calls(&self) -> bool {
        matches!(self, Message::Assistant(m) if !m.tool_calls.is_empty())
    }
}

impl AssistantMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn user_message_serde() {
        let msg = Message::user_text("app crashes on login");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["text"], "app crashes on login");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn assistant_without_calls_omits_field() {
        let json = serde_json::to_value(Message::assistant_text("done")).unwrap();
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn assistant_tool_calls_roundtrip() {
        let msg = Message::Assistant(AssistantMessage {
            text: String::new(),
            tool_calls: vec![ToolCallBlock {
                id: ToolCallId::from_raw("call_1"),
                name: "search_similar_tickets".into(),
                arguments: json!({"query": "login crash"}),
            }],
        });
        assert!(msg.has_tool_calls());
        let s = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&s).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn tool_result_defaults_is_error() {
        let back: Message = serde_json::from_value(json!({
            "role": "tool_result",
            "tool_call_id": "call_9",
            "content": "ok"
        }))
        .unwrap();
        match back {
            Message::ToolResult(m) => assert!(!m.is_error),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn char_len_counts_tool_arguments() {
        let msg = Message::Assistant(AssistantMessage {
            text: "ab".into(),
            tool_calls: vec![ToolCallBlock {
                id: ToolCallId::new(),
                name: "t".into(),
                arguments: json!({}),
            }],
        });
        assert_eq!(msg.char_len(), 2 + 1 + 2);
        assert_eq!(Message::user_text("héllo").char_len(), 5);
    }
}
