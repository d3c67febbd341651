use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{error, info, instrument, warn};

use triage_core::events::PipelineEvent;
use triage_core::ids::SessionId;
use triage_core::provider::ModelProvider;

use crate::approval::{Disposition, ResumeFeedback};
use crate::composer::SequentialComposer;
use crate::emitter::{Emitter, EventStream};
use crate::error::EngineError;
use crate::governor::{ToolCallGovernor, DEFAULT_TOOL_CALL_CEILING};
use crate::session::{Session, SessionStatus, SessionStore};
use crate::stage::{RunContext, DEFAULT_TOOL_TIMEOUT};

pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub tool_call_ceiling: u32,
    pub tool_timeout: Duration,
    /// How long a session may wait on an approval before it is failed.
    pub approval_ttl: Duration,
    /// How long completed and failed sessions are kept.
    pub retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool_call_ceiling: DEFAULT_TOOL_CALL_CEILING,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            approval_ttl: DEFAULT_APPROVAL_TTL,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// A request to start a new session.
#[derive(Clone, Debug, Default)]
pub struct Invocation {
    pub session_id: Option<SessionId>,
    pub input: String,
    pub ticket_id: Option<String>,
}

impl Invocation {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, id: SessionId) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn with_ticket_id(mut self, ticket_id: impl Into<String>) -> Self {
        self.ticket_id = Some(ticket_id.into());
        self
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct EvictionReport {
    pub expired: Vec<SessionId>,
    pub purged: usize,
}

/// Exclusive right to run one session. Released on drop.
struct Lease {
    leases: Arc<DashMap<SessionId, ()>>,
    id: SessionId,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leases.remove(&self.id);
    }
}

/// Runs a pipeline for many sessions, one execution per session at a time.
pub struct Engine {
    pipeline: Arc<SequentialComposer>,
    provider: Arc<dyn ModelProvider>,
    store: Arc<dyn SessionStore>,
    governor: Arc<ToolCallGovernor>,
    leases: Arc<DashMap<SessionId, ()>>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        pipeline: SequentialComposer,
        provider: Arc<dyn ModelProvider>,
        store: Arc<dyn SessionStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            provider,
            store,
            governor: Arc::new(ToolCallGovernor::new(config.tool_call_ceiling)),
            leases: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn pipeline(&self) -> &SequentialComposer {
        &self.pipeline
    }

    pub fn governor(&self) -> &ToolCallGovernor {
        &self.governor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self, id: &SessionId) -> Result<Option<Session>, EngineError> {
        self.store.load(id)
    }

    /// Run a new session to completion, failure, or its first suspension.
    #[instrument(skip(self, request), fields(session_id))]
    pub async fn invoke(&self, request: Invocation) -> Result<Session, EngineError> {
        let (lease, session) = self.prepare(request)?;
        tracing::Span::current().record("session_id", tracing::field::display(&session.id));
        self.run_new(lease, session, Emitter::disabled()).await
    }

    /// Start a new session in the background and return its event stream.
    pub fn stream(self: &Arc<Self>, request: Invocation) -> Result<(SessionId, EventStream), EngineError> {
        let (lease, session) = self.prepare(request)?;
        let id = session.id.clone();
        let (emitter, stream) = Emitter::channel();
        let engine = Arc::clone(self);
        // Failures reach the stream as `session_failed` from `conclude`.
        tokio::spawn(async move {
            let _ = engine.run_new(lease, session, emitter).await;
        });
        Ok((id, stream))
    }

    /// Apply a reviewer's decision to a suspended session and continue it.
    #[instrument(skip(self, feedback), fields(session_id = %session_id))]
    pub async fn resume(
        &self,
        session_id: &SessionId,
        feedback: ResumeFeedback,
    ) -> Result<Session, EngineError> {
        let (lease, session) = self.prepare_resume(session_id, &feedback)?;
        self.run_resumed(lease, session, feedback, Emitter::disabled()).await
    }

    /// Like [`Engine::resume`], but continues in the background and returns the
    /// event stream, opening with `session_resumed`. Protocol errors are returned
    /// before anything is spawned.
    pub fn resume_stream(
        self: &Arc<Self>,
        session_id: &SessionId,
        feedback: ResumeFeedback,
    ) -> Result<EventStream, EngineError> {
        let (lease, session) = self.prepare_resume(session_id, &feedback)?;
        let (emitter, stream) = Emitter::channel();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _ = engine.run_resumed(lease, session, feedback, emitter).await;
        });
        Ok(stream)
    }

    fn prepare_resume(
        &self,
        session_id: &SessionId,
        feedback: &ResumeFeedback,
    ) -> Result<(Lease, Session), EngineError> {
        feedback.validate()?;
        let lease = self.acquire(session_id)?;
        let session = self
            .store
            .load(session_id)?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.clone()))?;
        if session.status != SessionStatus::AwaitingApproval {
            return Err(EngineError::NotSuspended {
                session_id: session_id.clone(),
                status: session.status.to_string(),
            });
        }
        if session.pending_invocation(&feedback.invocation_id).is_none() {
            return Err(EngineError::UnknownInvocation {
                session_id: session_id.clone(),
                invocation_id: feedback.invocation_id.clone(),
            });
        }
        Ok((lease, session))
    }

    async fn run_resumed(
        &self,
        lease: Lease,
        mut session: Session,
        feedback: ResumeFeedback,
        emitter: Emitter,
    ) -> Result<Session, EngineError> {
        info!(
            session_id = %session.id,
            invocation_id = %feedback.invocation_id,
            disposition = feedback.disposition.as_str(),
            "session resumed"
        );
        emitter.emit(PipelineEvent::SessionResumed {
            session_id: session.id.clone(),
            invocation_id: feedback.invocation_id.clone(),
            approved: feedback.disposition == Disposition::Approved,
        });
        let ctx = self.context(emitter.clone());
        let outcome = self
            .pipeline
            .resume(&mut session, &feedback, &ctx, self.store.as_ref())
            .await;
        drop(lease);
        self.conclude(session, outcome, &emitter)
    }

    /// Fail sessions whose approval wait exceeded the TTL, then purge old terminal sessions.
    #[instrument(skip(self))]
    pub fn evict_expired(&self) -> Result<EvictionReport, EngineError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.approval_ttl)
            .map_err(|e| EngineError::Internal(format!("approval ttl out of range: {e}")))?;
        let retention = chrono::Duration::from_std(self.config.retention)
            .map_err(|e| EngineError::Internal(format!("retention out of range: {e}")))?;

        let mut report = EvictionReport::default();
        for candidate in self.store.awaiting_approval()? {
            let waiting_since = candidate.suspended_at.unwrap_or(candidate.updated_at);
            if now - waiting_since < ttl {
                continue;
            }
            let Ok(_lease) = self.acquire(&candidate.id) else {
                continue;
            };
            // Re-read under the lease; a resume may have finished in between.
            let Some(mut session) = self.store.load(&candidate.id)? else {
                continue;
            };
            if session.status != SessionStatus::AwaitingApproval {
                continue;
            }
            session.suspension = None;
            session.suspended_at = None;
            session.fail("approval expired");
            session.touch();
            self.store.save(&session)?;
            self.governor.reset(&session.id);
            warn!(session_id = %session.id, "approval expired");
            report.expired.push(session.id);
        }
        report.purged = self.store.purge_terminal(now - retention)?;
        Ok(report)
    }

    fn acquire(&self, id: &SessionId) -> Result<Lease, EngineError> {
        match self.leases.entry(id.clone()) {
            Entry::Occupied(_) => Err(EngineError::SessionBusy(id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Lease {
                    leases: Arc::clone(&self.leases),
                    id: id.clone(),
                })
            }
        }
    }

    fn context(&self, emitter: Emitter) -> RunContext {
        RunContext::new(Arc::clone(&self.provider), Arc::clone(&self.governor))
            .with_emitter(emitter)
            .with_tool_timeout(self.config.tool_timeout)
    }

    fn prepare(&self, request: Invocation) -> Result<(Lease, Session), EngineError> {
        let id = request.session_id.unwrap_or_default();
        let lease = self.acquire(&id)?;
        if self.store.load(&id)?.is_some() {
            return Err(EngineError::SessionExists(id));
        }
        let session = Session::new(id, self.pipeline.name(), request.input)
            .with_ticket_id(request.ticket_id);
        self.store.save(&session)?;
        Ok((lease, session))
    }

    async fn run_new(
        &self,
        lease: Lease,
        mut session: Session,
        emitter: Emitter,
    ) -> Result<Session, EngineError> {
        info!(session_id = %session.id, pipeline = %self.pipeline.name(), "session started");
        emitter.emit(PipelineEvent::SessionStarted {
            session_id: session.id.clone(),
            pipeline: self.pipeline.name().to_string(),
        });
        let ctx = self.context(emitter.clone());
        let outcome = self
            .pipeline
            .run(&mut session, &ctx, self.store.as_ref())
            .await;
        drop(lease);
        self.conclude(session, outcome, &emitter)
    }

    /// Emit the terminal event for a run. Called after the lease is released.
    /// Every error path emits `session_failed` before returning.
    fn conclude(
        &self,
        session: Session,
        outcome: Result<(), EngineError>,
        emitter: &Emitter,
    ) -> Result<Session, EngineError> {
        if let Err(e) = outcome {
            error!(session_id = %session.id, error = %e, "session run aborted");
            self.governor.reset(&session.id);
            emitter.emit(PipelineEvent::SessionFailed {
                session_id: session.id.clone(),
                error: e.to_string(),
            });
            return Err(e);
        }

        match session.status {
            SessionStatus::Completed => {
                self.governor.reset(&session.id);
                info!(session_id = %session.id, "session completed");
                emitter.emit(PipelineEvent::SessionCompleted {
                    session_id: session.id.clone(),
                });
            }
            SessionStatus::Failed => {
                self.governor.reset(&session.id);
                let error = session.error.clone().unwrap_or_default();
                warn!(session_id = %session.id, error = %error, "session failed");
                emitter.emit(PipelineEvent::SessionFailed {
                    session_id: session.id.clone(),
                    error,
                });
            }
            SessionStatus::AwaitingApproval => {
                let pending = session
                    .pending_invocations()
                    .into_iter()
                    .map(|r| r.invocation_id.clone())
                    .collect();
                info!(session_id = %session.id, "session awaiting approval");
                emitter.emit(PipelineEvent::SessionSuspended {
                    session_id: session.id.clone(),
                    pending,
                });
            }
            SessionStatus::Running => {
                let e = EngineError::Internal(format!("session {} stopped while still running", session.id));
                self.governor.reset(&session.id);
                emitter.emit(PipelineEvent::SessionFailed {
                    session_id: session.id.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        }
        Ok(session)
    }
}
