use serde::{Deserialize, Serialize};

/// Points in a stage loop where interceptors run, in evaluation order.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// Before each model call. May rewrite the conversation.
    PreCall,
    /// Before a tool call is dispatched. May suspend the stage.
    PreDispatch,
    /// After a tool result is produced, before it joins the conversation.
    PostToolResult,
    /// Before the stage returns its delta.
    PreTermination,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::PreCall => "pre_call",
            HookPoint::PreDispatch => "pre_dispatch",
            HookPoint::PostToolResult => "post_tool_result",
            HookPoint::PreTermination => "pre_termination",
        }
    }
}

/// Decision returned by a pre-dispatch interceptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookDecision {
    Continue,
    Suspend { description: String },
}

impl HookDecision {
    pub fn is_suspend(&self) -> bool {
        matches!(self, HookDecision::Suspend { .. })
    }
}
