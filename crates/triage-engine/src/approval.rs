use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use triage_core::ids::ToolCallId;
use triage_core::messages::ToolCallBlock;
use triage_core::ticket::PendingApproval;

use crate::error::EngineError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Pending,
    Approved,
    Rejected,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Pending => "pending",
            Disposition::Approved => "approved",
            Disposition::Rejected => "rejected",
        }
    }
}

/// A gated tool call awaiting a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub invocation_id: ToolCallId,
    pub stage: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub description: String,
    pub disposition: Disposition,
    pub created_at: DateTime<Utc>,
}

impl ToolInvocationRecord {
    pub fn pending(stage: &str, call: &ToolCallBlock, description: impl Into<String>) -> Self {
        Self {
            invocation_id: call.id.clone(),
            stage: stage.to_string(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            description: description.into(),
            disposition: Disposition::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.disposition == Disposition::Pending
    }

    /// Move out of `Pending`. Any other transition is refused.
    pub fn resolve(&mut self, disposition: Disposition) -> Result<(), EngineError> {
        match (self.disposition, disposition) {
            (Disposition::Pending, Disposition::Approved | Disposition::Rejected) => {
                self.disposition = disposition;
                Ok(())
            }
            (from, to) => Err(EngineError::InvalidFeedback(format!(
                "invocation {} cannot move from {} to {}",
                self.invocation_id,
                from.as_str(),
                to.as_str()
            ))),
        }
    }

    pub fn to_pending_approval(&self) -> PendingApproval {
        PendingApproval {
            invocation_id: self.invocation_id.clone(),
            stage: self.stage.clone(),
            tool_name: self.tool_name.clone(),
            arguments: self.arguments.clone(),
            description: self.description.clone(),
        }
    }
}

/// A reviewer's answer to a pending invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeFeedback {
    pub invocation_id: ToolCallId,
    pub disposition: Disposition,
    /// Approved: used verbatim as the tool result instead of executing the tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Approved: replacement arguments for the tool call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
    /// Rejected: shown to the model alongside the rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ResumeFeedback {
    pub fn approve(invocation_id: ToolCallId) -> Self {
        Self {
            invocation_id,
            disposition: Disposition::Approved,
            result: None,
            arguments: None,
            reason: None,
        }
    }

    pub fn reject(invocation_id: ToolCallId, reason: Option<String>) -> Self {
        Self {
            invocation_id,
            disposition: Disposition::Rejected,
            result: None,
            arguments: None,
            reason,
        }
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = Some(arguments);
        self
    }

    pub fn is_approved(&self) -> bool {
        self.disposition == Disposition::Approved
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.disposition == Disposition::Pending {
            return Err(EngineError::InvalidFeedback(
                "feedback must approve or reject".into(),
            ));
        }
        Ok(())
    }

    /// Tool result text sent to the model for a rejected call.
    pub fn rejection_message(&self, tool_name: &str) -> String {
        match self.reason.as_deref().filter(|r| !r.trim().is_empty()) {
            Some(reason) => format!(
                "[rejected] The call to `{tool_name}` was rejected by a reviewer: {reason}. \
                 Do not retry it; continue without its result."
            ),
            None => format!(
                "[rejected] The call to `{tool_name}` was rejected by a reviewer. \
                 Do not retry it; continue without its result."
            ),
        }
    }
}
