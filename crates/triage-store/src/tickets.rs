use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use triage_core::ticket::{AnalysisResult, FeedbackTicket};

use crate::database::Database;
use crate::error::StoreError;
use crate::sessions::timestamp;

#[derive(Clone, Debug, PartialEq)]
pub struct TicketRow {
    pub ticket: FeedbackTicket,
    pub analysis: Option<AnalysisResult>,
    pub created_at: String,
    pub updated_at: String,
}

/// Finished tickets and their analysis results.
pub struct TicketRepo {
    db: Database,
}

impl TicketRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update a ticket. The ticket must carry an id.
    #[instrument(skip_all, fields(ticket_id = ticket.ticket_id.as_deref().unwrap_or_default()))]
    pub fn store(
        &self,
        ticket: &FeedbackTicket,
        analysis: Option<&AnalysisResult>,
    ) -> Result<(), StoreError> {
        let ticket_id = ticket
            .ticket_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| StoreError::InvalidRecord("ticket has no id".into()))?;
        let category = ticket
            .category
            .or_else(|| analysis.and_then(|a| a.category))
            .map(|c| c.as_str().to_string());
        let ticket_json = serde_json::to_string(ticket)?;
        let analysis_json = analysis.map(serde_json::to_string).transpose()?;
        let now = timestamp(Utc::now());

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tickets (ticket_id, user_id, user_request, problem_description,
                                      phone_model, app_version, category, ticket_json,
                                      analysis_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT(ticket_id) DO UPDATE SET
                     category = COALESCE(excluded.category, tickets.category),
                     ticket_json = excluded.ticket_json,
                     analysis_json = COALESCE(excluded.analysis_json, tickets.analysis_json),
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    ticket_id,
                    ticket.user_id,
                    ticket.user_request,
                    ticket.problem_description,
                    ticket.phone_model,
                    ticket.app_version,
                    category,
                    ticket_json,
                    analysis_json,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, ticket_id: &str) -> Result<TicketRow, StoreError> {
        let raw = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT ticket_json, analysis_json, created_at, updated_at
                     FROM tickets WHERE ticket_id = ?1",
                    [ticket_id],
                    raw_row,
                )
                .optional()?)
        })?;
        match raw {
            Some(raw) => decode(raw),
            None => Err(StoreError::NotFound(format!("ticket {ticket_id}"))),
        }
    }

    /// Most recently updated tickets, optionally restricted to one category.
    pub fn list(&self, category: Option<&str>, limit: u32) -> Result<Vec<TicketRow>, StoreError> {
        let raws = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ticket_json, analysis_json, created_at, updated_at
                 FROM tickets WHERE (?1 IS NULL OR category = ?1)
                 ORDER BY updated_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![category, limit], raw_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;
        raws.into_iter().map(decode).collect()
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM tickets", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }
}

type RawRow = (String, Option<String>, String, String);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode((ticket_json, analysis_json, created_at, updated_at): RawRow) -> Result<TicketRow, StoreError> {
    Ok(TicketRow {
        ticket: serde_json::from_str(&ticket_json)?,
        analysis: analysis_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use triage_core::ticket::{AnalysisStatus, TicketCategory};
    use triage_core::state::State;

    fn repo() -> TicketRepo {
        TicketRepo::new(Database::in_memory().unwrap())
    }

    fn ticket(id: &str) -> FeedbackTicket {
        FeedbackTicket {
            ticket_id: Some(id.into()),
            user_request: "app crashes on login".into(),
            problem_description: "after update".into(),
            phone_model: Some("Pixel 7".into()),
            ..Default::default()
        }
    }

    #[test]
    fn store_and_get() {
        let repo = repo();
        repo.store(&ticket("T-1"), None).unwrap();
        let row = repo.get("T-1").unwrap();
        assert_eq!(row.ticket.phone_model.as_deref(), Some("Pixel 7"));
        assert!(row.analysis.is_none());
    }

    #[test]
    fn store_with_analysis_sets_category() {
        let repo = repo();
        let mut analysis = AnalysisResult::from_state(&State::new(), true, AnalysisStatus::Completed);
        analysis.category = Some(TicketCategory::BugReport);
        repo.store(&ticket("T-2"), Some(&analysis)).unwrap();

        let listed = repo.list(Some("BUG_REPORT"), 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].analysis.as_ref().unwrap().category, Some(TicketCategory::BugReport));
        assert!(repo.list(Some("OTHER"), 10).unwrap().is_empty());
        assert_eq!(repo.list(None, 10).unwrap().len(), 1);
    }

    #[test]
    fn upsert_keeps_existing_analysis() {
        let repo = repo();
        let analysis = AnalysisResult::failure("model down");
        repo.store(&ticket("T-3"), Some(&analysis)).unwrap();
        repo.store(&ticket("T-3"), None).unwrap();
        let row = repo.get("T-3").unwrap();
        assert_eq!(row.analysis.unwrap().error_message.as_deref(), Some("model down"));
        assert_eq!(repo.count().unwrap(), 1);
    }

    #[test]
    fn ticket_without_id_rejected() {
        let repo = repo();
        let err = repo.store(&FeedbackTicket::default(), None).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRecord(_)));
    }

    #[test]
    fn missing_ticket_not_found() {
        assert!(matches!(repo().get("nope"), Err(StoreError::NotFound(_))));
    }
}
