//! Error handling module for the execution engine
//!
//! Provides the engine's error taxonomy using thiserror. Every error maps to an
//! [`ErrorKind`] and a stable, machine-readable reason code so callers can
//! branch on failures without parsing messages.

use crate::plan::PlanError;
use crate::preflight::Finding;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

/// Coarse classification of every failure the engine can report.
///
/// Persisted with failed step attempts, so the string forms are part of the
/// on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed plan or step
    Validation,
    /// An error-severity preflight finding
    PreflightBlocked,
    /// Non-zero exit or process error
    CommandFailed,
    /// Command succeeded but its verification did not
    VerificationFailed,
    /// Step exceeded its timeout
    TimeoutExceeded,
    /// Another executor holds the session lease
    SessionLocked,
    /// A rollback command (or its verification) failed
    RollbackFailed,
    /// Unknown session or backup
    NotFound,
    /// Operation not allowed in the session's current status
    InvalidState,
    /// State store, filesystem or serialization failure
    Storage,
}

impl ErrorKind {
    /// Machine-readable reason code.
    pub const fn reason_code(self) -> &'static str {
        match self {
            Self::Validation => "E_VALIDATION",
            Self::PreflightBlocked => "E_PREFLIGHT_BLOCKED",
            Self::CommandFailed => "E_COMMAND_FAILED",
            Self::VerificationFailed => "E_VERIFICATION_FAILED",
            Self::TimeoutExceeded => "E_TIMEOUT",
            Self::SessionLocked => "E_SESSION_LOCKED",
            Self::RollbackFailed => "E_ROLLBACK_FAILED",
            Self::NotFound => "E_NOT_FOUND",
            Self::InvalidState => "E_INVALID_STATE",
            Self::Storage => "E_STORAGE",
        }
    }

    /// Whether a failure of this kind goes through the retry policy instead of
    /// ending the session outright.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::CommandFailed | Self::VerificationFailed | Self::TimeoutExceeded
        )
    }
}

/// Structured description of one failed step attempt.
///
/// The command summary is always redacted; raw argv never leaves the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub step_index: u32,
    pub step_name: String,
    pub command_summary: String,
    pub reason: String,
}

impl StepFailure {
    pub fn reason_code(&self) -> &'static str {
        self.kind.reason_code()
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step {} ({}) failed [{}]: {} (command: {})",
            self.step_index,
            self.step_name,
            self.kind.reason_code(),
            self.reason,
            self.command_summary
        )
    }
}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Plan failed validation before anything was executed
    #[error("Validation error: {0}")]
    Validation(#[from] PlanError),

    /// Preflight gate reported at least one error-severity finding
    #[error("Preflight blocked: {}", summarize_findings(.findings))]
    PreflightBlocked { findings: Vec<Finding> },

    /// A step attempt failed and was surfaced to the caller
    #[error("{0}")]
    Step(StepFailure),

    /// Another executor currently holds the session lease
    #[error("Session {session_id} is locked by another executor")]
    SessionLocked { session_id: String },

    /// A reversal failed; manual remediation is required
    #[error(
        "Rollback of session {session_id} blocked at {blocker}; backup {backup_id} is partially restored: {reason}"
    )]
    RollbackFailed {
        session_id: String,
        backup_id: String,
        /// Set when the blocker is a step's rollback command
        step_index: Option<u32>,
        /// e.g. `step 2 (Configure AdGuard)` or `file /etc/docker/daemon.json`
        blocker: String,
        reason: String,
    },

    /// Unknown session, backup, or other record
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Operation is not permitted in the current session status
    #[error("Cannot {action} session {session_id} while it is {status}")]
    InvalidState {
        session_id: String,
        status: String,
        action: &'static str,
    },

    /// Store invariant or integrity violation
    #[error("State store error: {0}")]
    Integrity(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::PreflightBlocked { .. } => ErrorKind::PreflightBlocked,
            Self::Step(failure) => failure.kind,
            Self::SessionLocked { .. } => ErrorKind::SessionLocked,
            Self::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Integrity(_) | Self::Sqlite(_) | Self::Io(_) | Self::Json(_) => {
                ErrorKind::Storage
            }
        }
    }

    pub fn reason_code(&self) -> &'static str {
        self.kind().reason_code()
    }

    /// Create a store integrity error
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Create a not-found error for a session
    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "session",
            id: id.into(),
        }
    }

    /// Create a not-found error for a backup
    pub fn backup_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            what: "backup",
            id: id.into(),
        }
    }
}

fn summarize_findings(findings: &[Finding]) -> String {
    findings
        .iter()
        .filter(|f| f.is_blocking())
        .map(|f| format!("{}: {}", f.check_name, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}
