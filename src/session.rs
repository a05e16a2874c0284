//! Session and attempt records
//!
//! A [`Session`] is one execution of a plan. Its status follows a small state
//! machine; the store refuses any transition not listed here:
//!
//! ```text
//! Pending ──▶ Running ──▶ Completed
//!    │         │  ▲  ╲──▶ RolledBack
//!    │         ▼  │   ╲─▶ Failed ──(manual rollback)──▶ Running
//!    │        Paused
//!    └──────────────────▶ Failed
//! ```
//!
//! Completed and RolledBack are terminal.

use crate::breaker::CircuitBreaker;
use crate::error::ErrorKind;
use crate::plan::Plan;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
}

impl SessionStatus {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, RolledBack)
                | (Paused, Running)
                | (Failed, Running)
        )
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Pending => "Not started",
            Self::Running => "Running",
            Self::Paused => "Paused, waiting for resume or a decision",
            Self::Completed => "All steps succeeded",
            Self::Failed => "Failed",
            Self::RolledBack => "Rolled back",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Terminal attempt rows are never mutated.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Snapshot taken at creation; later plan edits do not affect the session
    pub plan: Plan,
    pub status: SessionStatus,
    /// Position (in plan order) of the next step to run; `plan.steps.len()`
    /// once every step has been handled
    pub current_step_index: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub breaker: CircuitBreaker,
    pub last_error: Option<String>,
    /// Backup taken before the first step
    pub backup_id: Option<String>,
    /// Extra attempts granted per step index by `Decision::Retry`
    pub retry_grants: BTreeMap<u32, u32>,
}

impl Session {
    pub fn new(id: String, plan: Plan, now: DateTime<Utc>) -> Self {
        Self {
            id,
            plan,
            status: SessionStatus::Pending,
            current_step_index: 0,
            started_at: now,
            updated_at: now,
            breaker: CircuitBreaker::default(),
            last_error: None,
            backup_id: None,
            retry_grants: BTreeMap::new(),
        }
    }

    pub fn granted_attempts(&self, step_index: u32) -> u32 {
        self.retry_grants.get(&step_index).copied().unwrap_or(0)
    }

    pub fn progress(&self) -> (u32, usize) {
        (self.current_step_index, self.plan.steps.len())
    }
}

/// One attempt at one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecution {
    pub session_id: String,
    pub step_index: u32,
    pub attempt_number: u32,
    pub status: StepStatus,
    /// Redacted tail of the combined output
    pub output_excerpt: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub exit_code: Option<i32>,
}

impl StepExecution {
    pub fn running(session_id: &str, step_index: u32, attempt_number: u32, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            step_index,
            attempt_number,
            status: StepStatus::Running,
            output_excerpt: String::new(),
            started_at: now,
            finished_at: None,
            error_kind: None,
            exit_code: None,
        }
    }

    pub fn finish(
        mut self,
        status: StepStatus,
        excerpt: String,
        error_kind: Option<ErrorKind>,
        exit_code: Option<i32>,
        now: DateTime<Utc>,
    ) -> Self {
        self.status = status;
        self.output_excerpt = excerpt;
        self.error_kind = error_kind;
        self.exit_code = exit_code;
        self.finished_at = Some(now);
        self
    }
}
