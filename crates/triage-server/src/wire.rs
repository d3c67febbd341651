//! JSON shapes exchanged with HTTP clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use triage_core::events::PipelineEvent;
use triage_core::ids::{SessionId, ToolCallId};
use triage_core::state::State;
use triage_core::ticket::{AnalysisResult, PendingApproval};
use triage_engine::{ResumeFeedback, Session};

use crate::error::ApiError;

const PIPELINE_NODE: &str = "pipeline";

/// Payload of one `analysis_update` SSE event.
#[derive(Debug, Serialize)]
pub struct AnalysisUpdate {
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub event: PipelineEvent,
}

impl AnalysisUpdate {
    pub fn from_event(event: PipelineEvent) -> Self {
        let stage = event.stage().map(String::from);
        let content = match &event {
            PipelineEvent::StageIteration { text, .. } => text.clone(),
            PipelineEvent::StageCompleted { output, .. } => Some(output.clone()),
            PipelineEvent::StageFailed { error, .. } | PipelineEvent::SessionFailed { error, .. } => {
                Some(error.clone())
            }
            PipelineEvent::ApprovalRequired { description, .. } => Some(description.clone()),
            PipelineEvent::MergeConflict {
                slot,
                kept_branch,
                discarded_branch,
                ..
            } => Some(format!(
                "{slot}: kept {kept_branch}, discarded {discarded_branch}"
            )),
            _ => None,
        };
        Self {
            node: stage.clone().unwrap_or_else(|| PIPELINE_NODE.to_string()),
            stage,
            kind: event.event_type(),
            content,
            event,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackResult {
    #[default]
    Approved,
    Rejected,
}

/// Body of `POST /api/tickets/approve/{session_id}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub result: Option<FeedbackResult>,
    /// Replacement arguments, as JSON or as a JSON-encoded string.
    #[serde(default)]
    pub arguments: Option<Value>,
    /// Reviewer note; the rejection reason when rejecting.
    #[serde(default)]
    pub description: Option<String>,
    /// Tool output to use instead of running the tool.
    #[serde(default)]
    pub output: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ApproveRequest {
    /// Validate and convert into engine feedback. Returns the tool name too.
    pub fn into_feedback(self) -> Result<(String, ResumeFeedback), ApiError> {
        let id = non_empty(&self.id)
            .ok_or_else(|| ApiError::BadRequest("id is required".into()))?
            .to_string();
        let tool_name = non_empty(&self.tool_name)
            .ok_or_else(|| ApiError::BadRequest("toolName is required".into()))?
            .to_string();
        let invocation_id = ToolCallId::from_raw(id);

        let feedback = match self.result.unwrap_or_default() {
            FeedbackResult::Rejected => {
                ResumeFeedback::reject(invocation_id, non_empty(&self.description).map(String::from))
            }
            FeedbackResult::Approved => {
                let mut feedback = ResumeFeedback::approve(invocation_id);
                if let Some(output) = non_empty(&self.output) {
                    feedback = feedback.with_result(output);
                }
                if let Some(arguments) = parse_arguments(self.arguments)? {
                    feedback = feedback.with_arguments(arguments);
                }
                feedback
            }
        };
        Ok((tool_name, feedback))
    }
}

fn parse_arguments(arguments: Option<Value>) -> Result<Option<Value>, ApiError> {
    match arguments {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| ApiError::BadRequest(format!("arguments is not valid JSON: {e}"))),
        Some(other) => Ok(Some(other)),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveResponse {
    pub acknowledged: bool,
    pub session_id: SessionId,
    pub result: AnalysisResult,
}

/// Body of `GET /api/sessions/{session_id}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub pipeline: String,
    pub status: String,
    pub position: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pending_approvals: Vec<PendingApproval>,
    pub warnings: Vec<String>,
    pub truncated_stages: Vec<String>,
    pub state: State,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Session> for SessionSnapshot {
    fn from(session: Session) -> Self {
        Self {
            pending_approvals: session.pending_approvals(),
            session_id: session.id,
            pipeline: session.pipeline,
            status: session.status.to_string(),
            position: session.position,
            ticket_id: session.ticket_id,
            error: session.error,
            warnings: session.warnings,
            truncated_stages: session.truncated_stages,
            state: session.state,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorEvent {
    pub error: String,
}
