use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use tracing::instrument;

use triage_core::ids::SessionId;

use crate::database::Database;
use crate::error::StoreError;

/// A persisted session snapshot. The snapshot body is opaque JSON owned by the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionRow {
    pub id: SessionId,
    pub status: String,
    pub position: u32,
    pub snapshot: String,
    pub created_at: String,
    pub updated_at: String,
}

pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the snapshot for a session.
    #[instrument(skip(self, snapshot), fields(session_id = %id, status))]
    pub fn save(
        &self,
        id: &SessionId,
        status: &str,
        position: u32,
        snapshot: &str,
    ) -> Result<(), StoreError> {
        let now = timestamp(Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, status, position, snapshot, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     status = excluded.status,
                     position = excluded.position,
                     snapshot = excluded.snapshot,
                     updated_at = excluded.updated_at",
                rusqlite::params![id.as_str(), status, position, snapshot, now],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn find(&self, id: &SessionId) -> Result<Option<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, status, position, snapshot, created_at, updated_at
                     FROM sessions WHERE id = ?1",
                    [id.as_str()],
                    row_to_session,
                )
                .optional()?)
        })
    }

    pub fn get(&self, id: &SessionId) -> Result<SessionRow, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }

    /// Sessions with the given status, oldest update first.
    pub fn list_by_status(&self, status: &str, limit: u32) -> Result<Vec<SessionRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, status, position, snapshot, created_at, updated_at
                 FROM sessions WHERE status = ?1
                 ORDER BY updated_at ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![status, limit], row_to_session)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(n > 0)
        })
    }

    /// Delete sessions in `status` last updated before `cutoff`. Returns the count removed.
    #[instrument(skip(self), fields(status))]
    pub fn delete_updated_before(
        &self,
        status: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let cutoff = timestamp(cutoff);
        self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM sessions WHERE status = ?1 AND updated_at < ?2",
                rusqlite::params![status, cutoff],
            )?)
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare lexically.
pub(crate) fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: SessionId::from_raw(row.get::<_, String>(0)?),
        status: row.get(1)?,
        position: row.get(2)?,
        snapshot: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
