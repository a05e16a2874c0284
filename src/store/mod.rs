//! Durable state: sessions, step attempts, leases, backups and the rollback
//! log, in a single SQLite file.
//!
//! Every public operation runs in its own transaction, so a crash leaves the
//! previous or the new state, never a mix. Resume reads everything back from
//! here; nothing in memory is trusted across a restart.
//!
//! Integrity rules enforced here rather than in the engine:
//! - session status changes must be legal ([`SessionStatus::can_transition_to`])
//! - `current_step_index` only moves backwards through [`StateStore::rewind_step_index`]
//! - a terminal step attempt row is never rewritten

mod lease;
pub mod schema;

pub use lease::{Lease, LeaseGuard};

use crate::breaker::CircuitBreaker;
use crate::error::{EngineError, ErrorKind, Result};
use crate::rollback::{Backup, BackupStatus, CapturedPath, RollbackRecord};
use crate::session::{Session, SessionStatus, StepExecution, StepStatus};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Current time at the precision the store persists (milliseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub(crate) fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(row: &Row, idx: usize, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid_column(idx, column))
}

fn parse_opt_ts(row: &Row, idx: usize, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| invalid_column(idx, column))
    })
    .transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(
    row: &Row,
    idx: usize,
    column: &str,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|_| invalid_column(idx, column))
}

fn parse_enum<T: std::str::FromStr>(row: &Row, idx: usize, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|_| invalid_column(idx, column))
}

fn invalid_column(idx: usize, column: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, column.to_string(), rusqlite::types::Type::Text)
}

const SESSION_COLUMNS: &str = "id, plan_json, status, current_step_index, started_at, updated_at, \
     breaker_json, last_error, backup_id, retry_grants_json";

fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        plan: parse_json(row, 1, "plan_json")?,
        status: parse_enum(row, 2, "status")?,
        current_step_index: row.get(3)?,
        started_at: parse_ts(row, 4, "started_at")?,
        updated_at: parse_ts(row, 5, "updated_at")?,
        breaker: parse_json(row, 6, "breaker_json")?,
        last_error: row.get(7)?,
        backup_id: row.get(8)?,
        retry_grants: parse_json(row, 9, "retry_grants_json")?,
    })
}

const EXECUTION_COLUMNS: &str = "session_id, step_index, attempt_number, status, output_excerpt, \
     started_at, finished_at, error_kind, exit_code";

fn execution_from_row(row: &Row) -> rusqlite::Result<StepExecution> {
    let error_kind: Option<String> = row.get(7)?;
    Ok(StepExecution {
        session_id: row.get(0)?,
        step_index: row.get(1)?,
        attempt_number: row.get(2)?,
        status: parse_enum(row, 3, "status")?,
        output_excerpt: row.get(4)?,
        started_at: parse_ts(row, 5, "started_at")?,
        finished_at: parse_opt_ts(row, 6, "finished_at")?,
        error_kind: error_kind
            .map(|k| k.parse::<ErrorKind>().map_err(|_| invalid_column(7, "error_kind")))
            .transpose()?,
        exit_code: row.get(8)?,
    })
}

const BACKUP_COLUMNS: &str = "id, label, created_at, session_id, captured_json, status, blocker";

fn backup_from_row(row: &Row) -> rusqlite::Result<Backup> {
    let captured: Vec<CapturedPath> = parse_json(row, 4, "captured_json")?;
    Ok(Backup {
        id: row.get(0)?,
        label: row.get(1)?,
        created_at: parse_ts(row, 2, "created_at")?,
        session_id: row.get(3)?,
        captured_paths: captured,
        status: parse_enum(row, 5, "status")?,
        blocker: row.get(6)?,
    })
}

/// Handle to the state database. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("path", &self.path).finish()
    }
}

impl StateStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(journal_mode = %mode, "journal mode set");
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(mut conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        schema::migrate(&mut conn)?;
        info!(path = ?path, "state store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` in one transaction; commits only if `f` succeeds.
    fn transact<T>(
        &self,
        behavior: TransactionBehavior,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| EngineError::integrity("state store connection mutex poisoned"))?;
        let tx = conn.transaction_with_behavior(behavior)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.transact(TransactionBehavior::Immediate, f)
    }

    fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.transact(TransactionBehavior::Deferred, f)
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn create_session(&self, session: &Session) -> Result<()> {
        let plan_json = serde_json::to_string(&session.plan)?;
        let breaker_json = serde_json::to_string(&session.breaker)?;
        let grants_json = serde_json::to_string(&session.retry_grants)?;
        self.write(|tx| {
            tx.execute(
                &format!(
                    "INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    session.id,
                    plan_json,
                    session.status.to_string(),
                    session.current_step_index,
                    format_ts(&session.started_at),
                    format_ts(&session.updated_at),
                    breaker_json,
                    session.last_error,
                    session.backup_id,
                    grants_json,
                ],
            )?;
            Ok(())
        })?;
        debug!(session_id = %session.id, "session created");
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Session> {
        self.read(|tx| load_session(tx, id))
    }

    /// Sessions, newest first, optionally filtered by status.
    pub fn list_sessions(&self, status: Option<SessionStatus>) -> Result<Vec<Session>> {
        self.read(|tx| {
            let mut sessions = Vec::new();
            match status {
                Some(status) => {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ?1 ORDER BY started_at DESC, id"
                    ))?;
                    let rows = stmt.query_map([status.to_string()], session_from_row)?;
                    for row in rows {
                        sessions.push(row?);
                    }
                }
                None => {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at DESC, id"
                    ))?;
                    let rows = stmt.query_map([], session_from_row)?;
                    for row in rows {
                        sessions.push(row?);
                    }
                }
            }
            Ok(sessions)
        })
    }

    /// Move a session to `next`, recording `last_error` (cleared when `None`).
    pub fn update_session_status(
        &self,
        id: &str,
        next: SessionStatus,
        last_error: Option<&str>,
    ) -> Result<Session> {
        let session = self.write(|tx| {
            let mut session = load_session(tx, id)?;
            if session.status != next && !session.status.can_transition_to(next) {
                return Err(EngineError::InvalidState {
                    session_id: id.to_string(),
                    status: session.status.to_string(),
                    action: transition_action(next),
                });
            }
            session.status = next;
            session.last_error = last_error.map(str::to_string);
            session.updated_at = now();
            tx.execute(
                "UPDATE sessions SET status = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
                params![id, next.to_string(), session.last_error, format_ts(&session.updated_at)],
            )?;
            Ok(session)
        })?;
        info!(session_id = %id, status = %next, "session status updated");
        Ok(session)
    }

    /// Move the step cursor forward. Decreases are rejected.
    pub fn advance_step_index(&self, id: &str, index: u32) -> Result<()> {
        self.write(|tx| {
            let current: u32 = current_index(tx, id)?;
            if index < current {
                return Err(EngineError::integrity(format!(
                    "session {id}: step index may not decrease from {current} to {index} outside rollback"
                )));
            }
            set_index(tx, id, index)
        })
    }

    /// Move the step cursor backwards; only rollback calls this.
    pub fn rewind_step_index(&self, id: &str, index: u32) -> Result<()> {
        self.write(|tx| {
            let current: u32 = current_index(tx, id)?;
            if index > current {
                return Err(EngineError::integrity(format!(
                    "session {id}: rewind target {index} is ahead of {current}"
                )));
            }
            set_index(tx, id, index)
        })
    }

    pub fn save_breaker(&self, id: &str, breaker: &CircuitBreaker) -> Result<()> {
        let json = serde_json::to_string(breaker)?;
        self.update_column(id, "breaker_json", json)
    }

    pub fn save_retry_grants(&self, id: &str, grants: &BTreeMap<u32, u32>) -> Result<()> {
        let json = serde_json::to_string(grants)?;
        self.update_column(id, "retry_grants_json", json)
    }

    pub fn set_session_backup(&self, id: &str, backup_id: &str) -> Result<()> {
        self.update_column(id, "backup_id", backup_id.to_string())
    }

    fn update_column(&self, id: &str, column: &'static str, value: String) -> Result<()> {
        self.write(|tx| {
            let changed = tx.execute(
                &format!("UPDATE sessions SET {column} = ?2, updated_at = ?3 WHERE id = ?1"),
                params![id, value, format_ts(&now())],
            )?;
            if changed == 0 {
                return Err(EngineError::session_not_found(id));
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Step executions
    // ------------------------------------------------------------------

    /// Insert or update one attempt row. Terminal rows are immutable.
    pub fn upsert_step_execution(&self, exec: &StepExecution) -> Result<()> {
        self.write(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT status FROM step_executions \
                     WHERE session_id = ?1 AND step_index = ?2 AND attempt_number = ?3",
                    params![exec.session_id, exec.step_index, exec.attempt_number],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(status) => {
                    let status: StepStatus = status.parse().map_err(|_| {
                        EngineError::integrity(format!("unknown step status {status:?}"))
                    })?;
                    if status.is_terminal() {
                        return Err(EngineError::integrity(format!(
                            "attempt {} of step {} in session {} is already {}; terminal attempts are immutable",
                            exec.attempt_number, exec.step_index, exec.session_id, status
                        )));
                    }
                    tx.execute(
                        "UPDATE step_executions SET status = ?4, output_excerpt = ?5, finished_at = ?6, \
                         error_kind = ?7, exit_code = ?8 \
                         WHERE session_id = ?1 AND step_index = ?2 AND attempt_number = ?3",
                        params![
                            exec.session_id,
                            exec.step_index,
                            exec.attempt_number,
                            exec.status.to_string(),
                            exec.output_excerpt,
                            exec.finished_at.as_ref().map(format_ts),
                            exec.error_kind.map(|k| k.to_string()),
                            exec.exit_code,
                        ],
                    )?;
                }
                None => {
                    tx.execute(
                        &format!(
                            "INSERT INTO step_executions ({EXECUTION_COLUMNS}) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                        ),
                        params![
                            exec.session_id,
                            exec.step_index,
                            exec.attempt_number,
                            exec.status.to_string(),
                            exec.output_excerpt,
                            format_ts(&exec.started_at),
                            exec.finished_at.as_ref().map(format_ts),
                            exec.error_kind.map(|k| k.to_string()),
                            exec.exit_code,
                        ],
                    )?;
                }
            }
            tx.execute(
                "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
                params![exec.session_id, format_ts(&now())],
            )?;
            Ok(())
        })
    }

    /// Every attempt for a session, ordered by step then attempt.
    pub fn list_step_executions(&self, session_id: &str) -> Result<Vec<StepExecution>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM step_executions WHERE session_id = ?1 \
                 ORDER BY step_index, attempt_number"
            ))?;
            let rows = stmt.query_map([session_id], execution_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Highest-numbered attempt per step index.
    pub fn latest_step_executions(&self, session_id: &str) -> Result<HashMap<u32, StepExecution>> {
        let mut latest = HashMap::new();
        for exec in self.list_step_executions(session_id)? {
            latest.insert(exec.step_index, exec);
        }
        Ok(latest)
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    pub fn insert_backup(&self, backup: &Backup) -> Result<()> {
        let captured = serde_json::to_string(&backup.captured_paths)?;
        self.write(|tx| {
            tx.execute(
                &format!("INSERT INTO backups ({BACKUP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    backup.id,
                    backup.label,
                    format_ts(&backup.created_at),
                    backup.session_id,
                    captured,
                    backup.status.to_string(),
                    backup.blocker,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_backup(&self, id: &str) -> Result<Backup> {
        self.read(|tx| {
            tx.query_row(
                &format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?1"),
                [id],
                backup_from_row,
            )
            .optional()?
            .ok_or_else(|| EngineError::backup_not_found(id))
        })
    }

    /// All backups, newest first.
    pub fn list_backups(&self) -> Result<Vec<Backup>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(&format!(
                "SELECT {BACKUP_COLUMNS} FROM backups ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map([], backup_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn update_backup_status(
        &self,
        id: &str,
        status: BackupStatus,
        blocker: Option<&str>,
    ) -> Result<()> {
        self.write(|tx| {
            let changed = tx.execute(
                "UPDATE backups SET status = ?2, blocker = ?3 WHERE id = ?1",
                params![id, status.to_string(), blocker],
            )?;
            if changed == 0 {
                return Err(EngineError::backup_not_found(id));
            }
            Ok(())
        })
    }

    pub fn delete_backup(&self, id: &str) -> Result<()> {
        self.write(|tx| {
            let changed = tx.execute("DELETE FROM backups WHERE id = ?1", [id])?;
            if changed == 0 {
                return Err(EngineError::backup_not_found(id));
            }
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Rollback log
    // ------------------------------------------------------------------

    pub fn append_rollback_record(&self, record: &RollbackRecord) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO rollback_log (session_id, step_index, backup_id, succeeded, detail, at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.session_id,
                    record.step_index,
                    record.backup_id,
                    record.succeeded,
                    record.detail,
                    format_ts(&record.at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_rollback_records(&self, session_id: &str) -> Result<Vec<RollbackRecord>> {
        self.read(|tx| {
            let mut stmt = tx.prepare(
                "SELECT session_id, step_index, backup_id, succeeded, detail, at \
                 FROM rollback_log WHERE session_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([session_id], |row| {
                Ok(RollbackRecord {
                    session_id: row.get(0)?,
                    step_index: row.get(1)?,
                    backup_id: row.get(2)?,
                    succeeded: row.get(3)?,
                    detail: row.get(4)?,
                    at: parse_ts(row, 5, "at")?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

fn load_session(tx: &Transaction<'_>, id: &str) -> Result<Session> {
    tx.query_row(
        &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
        [id],
        session_from_row,
    )
    .optional()?
    .ok_or_else(|| EngineError::session_not_found(id))
}

fn current_index(tx: &Transaction<'_>, id: &str) -> Result<u32> {
    tx.query_row(
        "SELECT current_step_index FROM sessions WHERE id = ?1",
        [id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| EngineError::session_not_found(id))
}

fn set_index(tx: &Transaction<'_>, id: &str, index: u32) -> Result<()> {
    tx.execute(
        "UPDATE sessions SET current_step_index = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, index, format_ts(&now())],
    )?;
    Ok(())
}

fn transition_action(next: SessionStatus) -> &'static str {
    match next {
        SessionStatus::Pending => "reset",
        SessionStatus::Running => "run",
        SessionStatus::Paused => "pause",
        SessionStatus::Completed => "complete",
        SessionStatus::Failed => "fail",
        SessionStatus::RolledBack => "roll back",
    }
}
