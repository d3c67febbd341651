use rusqlite::Connection;

use crate::error::StoreError;

pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    snapshot TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, updated_at);

CREATE TABLE IF NOT EXISTS tickets (
    ticket_id TEXT PRIMARY KEY,
    user_id TEXT,
    user_request TEXT NOT NULL,
    problem_description TEXT NOT NULL,
    phone_model TEXT,
    app_version TEXT,
    category TEXT,
    ticket_json TEXT NOT NULL,
    analysis_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tickets_category ON tickets(category);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

/// Apply pragmas and tables, and stamp or check the schema version.
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(PRAGMAS)?;
    conn.execute_batch(CREATE_TABLES)?;

    let current: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    match current {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }
        Some(v) if v > SCHEMA_VERSION => {
            return Err(StoreError::Schema(format!(
                "database is at version {v}, this build supports up to {SCHEMA_VERSION}"
            )));
        }
        Some(_) => {}
    }
    Ok(())
}
