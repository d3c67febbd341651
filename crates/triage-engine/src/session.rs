use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use triage_core::ids::{SessionId, ToolCallId};
use triage_core::state::State;
use triage_core::ticket::{AnalysisResult, AnalysisStatus, PendingApproval};
use triage_store::{Database, SessionRepo};

use crate::approval::ToolInvocationRecord;
use crate::composer::{BranchState, ParallelCheckpoint};
use crate::error::EngineError;
use crate::stage::StageCursor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    AwaitingApproval,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::AwaitingApproval => "awaiting_approval",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "awaiting_approval" => Ok(SessionStatus::AwaitingApproval),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(EngineError::Internal(format!("unknown session status: {other}"))),
        }
    }
}

/// What a suspended session needs to continue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suspension {
    Stage {
        cursor: StageCursor,
        invocation: ToolInvocationRecord,
    },
    Parallel {
        checkpoint: ParallelCheckpoint,
    },
}

impl Suspension {
    pub fn pending(&self) -> Vec<&ToolInvocationRecord> {
        match self {
            Suspension::Stage { invocation, .. } => vec![invocation],
            Suspension::Parallel { checkpoint } => checkpoint.pending(),
        }
    }

    pub fn pending_mut(&mut self, id: &ToolCallId) -> Option<&mut ToolInvocationRecord> {
        match self {
            Suspension::Stage { invocation, .. } => {
                (invocation.invocation_id == *id).then_some(invocation)
            }
            Suspension::Parallel { checkpoint } => {
                checkpoint.branches.iter_mut().find_map(|b| match b {
                    BranchState::Suspended { invocation, .. } if invocation.invocation_id == *id => {
                        Some(invocation)
                    }
                    _ => None,
                })
            }
        }
    }
}

/// One execution of a pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub pipeline: String,
    pub status: SessionStatus,
    pub state: State,
    /// Index of the next step to run, or of the suspended step.
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
    /// Resolved approvals, oldest first.
    #[serde(default)]
    pub approvals: Vec<ToolInvocationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub truncated_stages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: SessionId, pipeline: impl Into<String>, input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            pipeline: pipeline.into(),
            status: SessionStatus::Running,
            state: State::with_input(input),
            position: 0,
            suspension: None,
            approvals: Vec::new(),
            error: None,
            warnings: Vec::new(),
            truncated_stages: Vec::new(),
            ticket_id: None,
            created_at: now,
            updated_at: now,
            suspended_at: None,
        }
    }

    pub fn with_ticket_id(mut self, ticket_id: Option<String>) -> Self {
        self.ticket_id = ticket_id;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn suspend(&mut self, suspension: Suspension) {
        self.status = SessionStatus::AwaitingApproval;
        self.suspension = Some(suspension);
        self.suspended_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.error = Some(error.into());
    }

    pub fn pending_invocations(&self) -> Vec<&ToolInvocationRecord> {
        self.suspension
            .as_ref()
            .map(Suspension::pending)
            .unwrap_or_default()
    }

    pub fn pending_invocation(&self, id: &ToolCallId) -> Option<&ToolInvocationRecord> {
        self.pending_invocations()
            .into_iter()
            .find(|r| &r.invocation_id == id)
    }

    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.pending_invocations()
            .into_iter()
            .map(ToolInvocationRecord::to_pending_approval)
            .collect()
    }

    /// Project the session into the caller-facing analysis result.
    pub fn to_result(&self) -> AnalysisResult {
        let status = match self.status {
            SessionStatus::Completed => AnalysisStatus::Completed,
            SessionStatus::AwaitingApproval => AnalysisStatus::AwaitingApproval,
            SessionStatus::Running | SessionStatus::Failed => AnalysisStatus::Failed,
        };
        let mut result = AnalysisResult::from_state(
            &self.state,
            self.status == SessionStatus::Completed,
            status,
        );
        result.session_id = Some(self.id.clone());
        result.ticket_id = self.ticket_id.clone();
        result.error_message = self.error.clone();
        result.warnings = self.warnings.clone();
        result.truncated_stages = self.truncated_stages.clone();
        result.pending_approvals = self.pending_approvals();
        result
    }
}

/// Durable home of session snapshots.
pub trait SessionStore: Send + Sync {
    fn load(&self, id: &SessionId) -> Result<Option<Session>, EngineError>;
    fn save(&self, session: &Session) -> Result<(), EngineError>;
    fn awaiting_approval(&self) -> Result<Vec<Session>, EngineError>;
    fn remove(&self, id: &SessionId) -> Result<bool, EngineError>;
    /// Delete completed and failed sessions last updated before `before`.
    fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize, EngineError>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<SessionId, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, id: &SessionId) -> Result<Option<Session>, EngineError> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    fn save(&self, session: &Session) -> Result<(), EngineError> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    fn awaiting_approval(&self) -> Result<Vec<Session>, EngineError> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::AwaitingApproval)
            .map(|s| s.clone())
            .collect())
    }

    fn remove(&self, id: &SessionId) -> Result<bool, EngineError> {
        Ok(self.sessions.remove(id).is_some())
    }

    fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize, EngineError> {
        let before_len = self.sessions.len();
        self.sessions
            .retain(|_, s| !(s.status.is_terminal() && s.updated_at < before));
        Ok(before_len - self.sessions.len())
    }
}

/// Sessions persisted as JSON snapshots in SQLite.
pub struct SqliteSessionStore {
    repo: SessionRepo,
}

impl SqliteSessionStore {
    pub fn new(db: Database) -> Self {
        Self {
            repo: SessionRepo::new(db),
        }
    }
}

impl SessionStore for SqliteSessionStore {
    fn load(&self, id: &SessionId) -> Result<Option<Session>, EngineError> {
        match self.repo.find(id)? {
            Some(row) => Ok(Some(serde_json::from_str(&row.snapshot)?)),
            None => Ok(None),
        }
    }

    fn save(&self, session: &Session) -> Result<(), EngineError> {
        let snapshot = serde_json::to_string(session)?;
        self.repo.save(
            &session.id,
            session.status.as_str(),
            session.position as u32,
            &snapshot,
        )?;
        Ok(())
    }

    fn awaiting_approval(&self) -> Result<Vec<Session>, EngineError> {
        self.repo
            .list_by_status(SessionStatus::AwaitingApproval.as_str(), u32::MAX)?
            .into_iter()
            .map(|row| serde_json::from_str::<Session>(&row.snapshot).map_err(EngineError::from))
            .collect()
    }

    fn remove(&self, id: &SessionId) -> Result<bool, EngineError> {
        Ok(self.repo.delete(id)?)
    }

    fn purge_terminal(&self, before: DateTime<Utc>) -> Result<usize, EngineError> {
        let mut purged = 0;
        for status in [SessionStatus::Completed, SessionStatus::Failed] {
            purged += self.repo.delete_updated_before(status.as_str(), before)?;
        }
        Ok(purged)
    }
}
