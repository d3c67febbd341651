use triage_core::errors::GatewayError;
use triage_core::ids::{SessionId, ToolCallId};
use triage_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already exists: {0}")]
    SessionExists(SessionId),

    #[error("session {session_id} is not awaiting approval (status: {status})")]
    NotSuspended { session_id: SessionId, status: String },

    #[error("no pending invocation {invocation_id} in session {session_id}")]
    UnknownInvocation {
        session_id: SessionId,
        invocation_id: ToolCallId,
    },

    #[error("session {0} is already running")]
    SessionBusy(SessionId),

    #[error("invalid feedback: {0}")]
    InvalidFeedback(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// True for errors caused by the caller rather than the engine.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            EngineError::SessionNotFound(_)
                | EngineError::SessionExists(_)
                | EngineError::NotSuspended { .. }
                | EngineError::UnknownInvocation { .. }
                | EngineError::SessionBusy(_)
                | EngineError::InvalidFeedback(_)
        )
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            EngineError::Gateway(_) => "gateway",
            EngineError::Store(_) => "store",
            EngineError::Serialization(_) => "serialization",
            EngineError::SessionNotFound(_) => "session_not_found",
            EngineError::SessionExists(_) => "session_exists",
            EngineError::NotSuspended { .. } => "not_suspended",
            EngineError::UnknownInvocation { .. } => "unknown_invocation",
            EngineError::SessionBusy(_) => "session_busy",
            EngineError::InvalidFeedback(_) => "invalid_feedback",
            EngineError::InvalidPipeline(_) => "invalid_pipeline",
            EngineError::Internal(_) => "internal",
        }
    }
}
