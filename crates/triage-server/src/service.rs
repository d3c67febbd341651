//! Ticket-level workflow around the engine: cache lookup, persistence, and
//! feeding finished tickets back into the similarity index.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use triage_core::ids::SessionId;
use triage_core::ticket::{AnalysisResult, FeedbackTicket};
use triage_engine::{Engine, EngineError, EventStream, Invocation, ResumeFeedback, Session, SessionStatus};
use triage_index::SimilarityIndex;
use triage_store::TicketRepo;

use crate::cache::ClassificationCache;

pub struct TicketService {
    engine: Arc<Engine>,
    cache: ClassificationCache,
    tickets: Arc<TicketRepo>,
    index: Arc<SimilarityIndex>,
}

impl TicketService {
    pub fn new(
        engine: Arc<Engine>,
        tickets: TicketRepo,
        index: Arc<SimilarityIndex>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            engine,
            cache: ClassificationCache::new(cache_ttl),
            tickets: Arc::new(tickets),
            index,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn cache(&self) -> &ClassificationCache {
        &self.cache
    }

    /// Analyze one ticket synchronously. Failures come back as `success=false`.
    #[instrument(skip_all, fields(ticket_id))]
    pub async fn analyze(&self, mut ticket: FeedbackTicket) -> AnalysisResult {
        if let Some(category) = self.cache.get(&ticket.cache_key()) {
            info!(category = %category, "classification cache hit");
            let mut result = AnalysisResult::cached(category);
            result.ticket_id = ticket.ticket_id.clone();
            return result;
        }

        let ticket_id = self.admit(&mut ticket);
        tracing::Span::current().record("ticket_id", ticket_id.as_str());
        let invocation = Invocation::new(ticket.analysis_input()).with_ticket_id(ticket_id.clone());
        match self.engine.invoke(invocation).await {
            Ok(session) => self.conclude(ticket, &session),
            Err(e) => {
                warn!(error = %e, "analysis failed");
                let mut result = AnalysisResult::failure(format!("analysis failed: {e}"));
                result.ticket_id = Some(ticket_id);
                result
            }
        }
    }

    /// Start a streamed analysis. The caller finishes it with [`Self::conclude`].
    pub fn stream(
        &self,
        mut ticket: FeedbackTicket,
    ) -> Result<(FeedbackTicket, SessionId, EventStream), EngineError> {
        let ticket_id = self.admit(&mut ticket);
        let invocation = Invocation::new(ticket.analysis_input()).with_ticket_id(ticket_id);
        let (session_id, events) = self.engine.stream(invocation)?;
        Ok((ticket, session_id, events))
    }

    /// Apply a reviewer's decision. `tool_name` must match the pending call.
    #[instrument(skip(self, feedback), fields(session_id = %session_id))]
    pub async fn approve(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        feedback: ResumeFeedback,
    ) -> Result<AnalysisResult, EngineError> {
        self.check_tool_name(session_id, tool_name, &feedback)?;
        let session = self.engine.resume(session_id, feedback).await?;
        Ok(self.finish_resumed(&session))
    }

    /// Start a streamed resume. The caller finishes it with [`Self::finish_resumed`].
    pub fn approve_stream(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        feedback: ResumeFeedback,
    ) -> Result<EventStream, EngineError> {
        self.check_tool_name(session_id, tool_name, &feedback)?;
        self.engine.resume_stream(session_id, feedback)
    }

    fn check_tool_name(
        &self,
        session_id: &SessionId,
        tool_name: &str,
        feedback: &ResumeFeedback,
    ) -> Result<(), EngineError> {
        let Some(session) = self.engine.session(session_id)? else {
            return Ok(());
        };
        match session.pending_invocation(&feedback.invocation_id) {
            Some(record) if record.tool_name != tool_name => Err(EngineError::InvalidFeedback(format!(
                "invocation {} is a call to {}, not {tool_name}",
                record.invocation_id, record.tool_name
            ))),
            _ => Ok(()),
        }
    }

    /// Project a resumed session into a result, recording it once completed.
    pub fn finish_resumed(&self, session: &Session) -> AnalysisResult {
        if session.status != SessionStatus::Completed {
            return session.to_result();
        }
        let ticket = session
            .ticket_id
            .as_deref()
            .map(|id| self.tickets.get(id))
            .transpose();
        match ticket {
            Ok(Some(row)) => self.conclude(row.ticket, session),
            Ok(None) => session.to_result(),
            Err(e) => {
                warn!(error = %e, "ticket for resumed session not found");
                session.to_result()
            }
        }
    }

    /// Project a stopped session into a result. A completed analysis
    /// refreshes the cache and is persisted and indexed in the background.
    pub fn conclude(&self, ticket: FeedbackTicket, session: &Session) -> AnalysisResult {
        let result = session.to_result();
        if result.success {
            if let Some(category) = result.category {
                self.cache.put(&ticket.cache_key(), category);
            }
            self.record(ticket, result.clone());
        }
        result
    }

    /// Load analyzed tickets from storage into the similarity index.
    /// Returns how many were indexed.
    pub async fn warm_index(&self, limit: u32) -> Result<usize, triage_store::StoreError> {
        let rows = self.tickets.list(None, limit)?;
        let mut indexed = 0;
        for row in rows.into_iter().filter(|row| row.analysis.is_some()) {
            let mut ticket = row.ticket;
            if ticket.category.is_none() {
                ticket.category = row.analysis.and_then(|a| a.category);
            }
            match self.index.ingest(&ticket.document_text(), ticket.index_metadata()).await {
                Ok(_) => indexed += 1,
                Err(e) => warn!(ticket_id = ?ticket.ticket_id, error = %e, "failed to index stored ticket"),
            }
        }
        info!(indexed, "similarity index warmed");
        Ok(indexed)
    }

    /// Assign an id if missing and save the ticket before analysis starts.
    fn admit(&self, ticket: &mut FeedbackTicket) -> String {
        let ticket_id = ticket.ensure_ticket_id();
        if let Err(e) = self.tickets.store(ticket, None) {
            warn!(ticket_id = %ticket_id, error = %e, "failed to save submitted ticket");
        }
        ticket_id
    }

    fn record(&self, mut ticket: FeedbackTicket, result: AnalysisResult) {
        if ticket.category.is_none() {
            ticket.category = result.category;
        }
        let tickets = Arc::clone(&self.tickets);
        let index = Arc::clone(&self.index);
        tokio::spawn(async move {
            let ticket_id = ticket.ticket_id.clone().unwrap_or_default();
            if let Err(e) = tickets.store(&ticket, Some(&result)) {
                warn!(ticket_id = %ticket_id, error = %e, "failed to save analyzed ticket");
                return;
            }
            match index.ingest(&ticket.document_text(), ticket.index_metadata()).await {
                Ok(record_id) => debug!(ticket_id = %ticket_id, record_id = %record_id, "ticket indexed"),
                Err(e) => warn!(ticket_id = %ticket_id, error = %e, "failed to index ticket"),
            }
        });
    }
}
