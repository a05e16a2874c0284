//! SQLite schema, versioned through `PRAGMA user_version`.

use rusqlite::Connection;
use tracing::info;

pub const SCHEMA_VERSION: i64 = 1;

const V1: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id                 TEXT PRIMARY KEY,
    plan_json          TEXT NOT NULL,
    status             TEXT NOT NULL,
    current_step_index INTEGER NOT NULL DEFAULT 0,
    started_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    breaker_json       TEXT NOT NULL,
    last_error         TEXT,
    backup_id          TEXT,
    retry_grants_json  TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);

CREATE TABLE IF NOT EXISTS step_executions (
    session_id     TEXT NOT NULL,
    step_index     INTEGER NOT NULL,
    attempt_number INTEGER NOT NULL,
    status         TEXT NOT NULL,
    output_excerpt TEXT NOT NULL DEFAULT '',
    started_at     TEXT NOT NULL,
    finished_at    TEXT,
    error_kind     TEXT,
    exit_code      INTEGER,
    PRIMARY KEY (session_id, step_index, attempt_number),
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS session_leases (
    session_id   TEXT PRIMARY KEY,
    holder       TEXT NOT NULL,
    pid          INTEGER NOT NULL,
    acquired_at  TEXT NOT NULL,
    heartbeat_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backups (
    id             TEXT PRIMARY KEY,
    label          TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    session_id     TEXT,
    captured_json  TEXT NOT NULL,
    status         TEXT NOT NULL,
    blocker        TEXT
);

CREATE INDEX IF NOT EXISTS idx_backups_session ON backups(session_id);

CREATE TABLE IF NOT EXISTS rollback_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    step_index INTEGER,
    backup_id  TEXT,
    succeeded  INTEGER NOT NULL,
    detail     TEXT NOT NULL,
    at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rollback_log_session ON rollback_log(session_id);
"#;

/// Bring `conn` up to [`SCHEMA_VERSION`].
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    info!(from = version, to = SCHEMA_VERSION, "migrating state store schema");
    let tx = conn.transaction()?;
    if version < 1 {
        tx.execute_batch(V1)?;
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("first");
        migrate(&mut conn).expect("second");
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
                 ('sessions', 'step_executions', 'session_leases', 'backups', 'rollback_log')",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(tables, 5);
    }
}
