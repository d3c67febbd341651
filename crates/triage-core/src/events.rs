use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, ToolCallId};
use crate::state::Slot;

/// Progress events emitted while a session executes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    SessionStarted {
        session_id: SessionId,
        pipeline: String,
    },
    SessionResumed {
        session_id: SessionId,
        invocation_id: ToolCallId,
        approved: bool,
    },
    StageStarted {
        session_id: SessionId,
        stage: String,
    },
    StageIteration {
        session_id: SessionId,
        stage: String,
        iteration: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<String>,
    },
    ToolDispatched {
        session_id: SessionId,
        stage: String,
        tool_call_id: ToolCallId,
        tool: String,
    },
    ToolCompleted {
        session_id: SessionId,
        stage: String,
        tool_call_id: ToolCallId,
        tool: String,
        is_error: bool,
        duration_ms: u64,
    },
    ApprovalRequired {
        session_id: SessionId,
        stage: String,
        invocation_id: ToolCallId,
        tool: String,
        arguments: serde_json::Value,
        description: String,
    },
    ToolRejected {
        session_id: SessionId,
        stage: String,
        invocation_id: ToolCallId,
        tool: String,
    },
    GovernorDenied {
        session_id: SessionId,
        stage: String,
        ceiling: u32,
    },
    StageCompleted {
        session_id: SessionId,
        stage: String,
        slot: Slot,
        output: String,
        truncated: bool,
    },
    StageFailed {
        session_id: SessionId,
        stage: String,
        error: String,
    },
    MergeConflict {
        session_id: SessionId,
        slot: Slot,
        kept_branch: String,
        discarded_branch: String,
    },
    SessionSuspended {
        session_id: SessionId,
        pending: Vec<ToolCallId>,
    },
    SessionCompleted {
        session_id: SessionId,
    },
    SessionFailed {
        session_id: SessionId,
        error: String,
    },
}

impl PipelineEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::SessionResumed { session_id, .. }
            | Self::StageStarted { session_id, .. }
            | Self::StageIteration { session_id, .. }
            | Self::ToolDispatched { session_id, .. }
            | Self::ToolCompleted { session_id, .. }
            | Self::ApprovalRequired { session_id, .. }
            | Self::ToolRejected { session_id, .. }
            | Self::GovernorDenied { session_id, .. }
            | Self::StageCompleted { session_id, .. }
            | Self::StageFailed { session_id, .. }
            | Self::MergeConflict { session_id, .. }
            | Self::SessionSuspended { session_id, .. }
            | Self::SessionCompleted { session_id }
            | Self::SessionFailed { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStarted { .. } => "session_started",
            Self::SessionResumed { .. } => "session_resumed",
            Self::StageStarted { .. } => "stage_started",
            Self::StageIteration { .. } => "stage_iteration",
            Self::ToolDispatched { .. } => "tool_dispatched",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::ToolRejected { .. } => "tool_rejected",
            Self::GovernorDenied { .. } => "governor_denied",
            Self::StageCompleted { .. } => "stage_completed",
            Self::StageFailed { .. } => "stage_failed",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::SessionSuspended { .. } => "session_suspended",
            Self::SessionCompleted { .. } => "session_completed",
            Self::SessionFailed { .. } => "session_failed",
        }
    }

    /// Stage that produced the event, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageStarted { stage, .. }
            | Self::StageIteration { stage, .. }
            | Self::ToolDispatched { stage, .. }
            | Self::ToolCompleted { stage, .. }
            | Self::ApprovalRequired { stage, .. }
            | Self::ToolRejected { stage, .. }
            | Self::GovernorDenied { stage, .. }
            | Self::StageCompleted { stage, .. }
            | Self::StageFailed { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// True for events after which the session stops emitting.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SessionCompleted { .. } | Self::SessionFailed { .. } | Self::SessionSuspended { .. }
        )
    }
}
