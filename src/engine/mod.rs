//! Execution engine
//!
//! Runs a [`Plan`] as a durable [`Session`]: steps strictly in order, each
//! attempt persisted before its result is acted on, retries paced by the
//! [`RetryPolicy`] and gated by the session's circuit breaker. Anything the
//! engine cannot settle on its own (an exhausted step that can be undone, an
//! unconfirmed privileged step, an open breaker) ends the call with the
//! session paused and a [`RunOutcome`] saying why.
//!
//! Every entry point takes the session lease first, so a second executor on
//! the same session gets `SessionLocked` instead of racing.

mod cancel;
mod driver;
mod outcome;

pub use cancel::CancelToken;
pub use outcome::{
    Decision, DecisionRequest, PauseReason, Preview, PreviewStep, PrivilegeConfirmation,
    RunOutcome, RunReport,
};

use crate::advisor::{HeuristicAdvisor, RecoveryAdvisor};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::plan::Plan;
use crate::preflight::{Finding, HostPreflight, PreflightGate};
use crate::retry::RetryPolicy;
use crate::rollback::RollbackManager;
use crate::runner::{CommandRunner, ProcessRunner};
use crate::session::{Session, SessionStatus, StepExecution, StepStatus};
use crate::store::{LeaseGuard, StateStore, now};
use driver::Mode;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Captured output kept in memory per command before it is cut to an excerpt.
const RUNNER_OUTPUT_LIMIT: usize = 64 * 1024;

pub struct Engine {
    store: StateStore,
    config: EngineConfig,
    runner: Arc<dyn CommandRunner>,
    preflight: Box<dyn PreflightGate>,
    advisors: Vec<Box<dyn RecoveryAdvisor>>,
    confirmations: Vec<PrivilegeConfirmation>,
    retry: RetryPolicy,
    cancel: CancelToken,
}

impl Engine {
    /// Engine with the host runner, host preflight and heuristic advisor.
    pub fn new(store: StateStore, config: EngineConfig) -> Self {
        let mut writable = vec![config.backup_dir.clone()];
        if let Some(parent) = config.state_db.parent().filter(|p| !p.as_os_str().is_empty()) {
            writable.push(parent.to_path_buf());
        }
        Self {
            runner: Arc::new(
                ProcessRunner::new(RUNNER_OUTPUT_LIMIT, config.kill_grace()).with_limits(config.limits),
            ),
            preflight: Box::new(HostPreflight::new(writable)),
            advisors: vec![Box::new(HeuristicAdvisor)],
            confirmations: Vec::new(),
            retry: RetryPolicy::new(&config.retry),
            cancel: CancelToken::new(),
            store,
            config,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_preflight(mut self, gate: impl PreflightGate + 'static) -> Self {
        self.preflight = Box::new(gate);
        self
    }

    /// Add an advisor; remediations from every advisor are concatenated.
    pub fn with_advisor(mut self, advisor: impl RecoveryAdvisor + 'static) -> Self {
        self.advisors.push(Box::new(advisor));
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle for requesting a cooperative stop from another thread or a
    /// signal handler.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Allow this engine to run the privileged steps covered by `confirmation`.
    pub fn confirm_privileged(&mut self, confirmation: PrivilegeConfirmation) {
        info!("privileged steps confirmed by operator");
        self.confirmations.push(confirmation);
    }

    fn is_confirmed(&self, plan_id: &str, step_index: u32) -> bool {
        self.confirmations.iter().any(|c| c.covers(plan_id, step_index))
    }

    /// Backup listing, deletion and pruning.
    pub fn backups(&self) -> RollbackManager {
        RollbackManager::new(
            self.store.clone(),
            Arc::clone(&self.runner),
            self.config.backup_dir.clone(),
        )
    }

    /// Validate `plan` and describe what `start` would do. Nothing runs and
    /// nothing is recorded.
    pub fn preview(&self, plan: &Plan) -> Result<Preview> {
        plan.validate()?;
        Ok(Preview {
            plan_id: plan.id.clone(),
            title: plan.title.clone(),
            steps: plan.steps.iter().map(PreviewStep::from_step).collect(),
            findings: self.preflight.check(plan),
        })
    }

    /// Validate, preflight, then run `plan` as a new session.
    #[instrument(skip_all, fields(plan_id = %plan.id))]
    pub fn start(&self, plan: Plan) -> Result<RunReport> {
        plan.validate()?;

        let findings = self.preflight.check(&plan);
        if findings.iter().any(Finding::is_blocking) {
            for f in findings.iter().filter(|f| f.is_blocking()) {
                error!(check = %f.check_name, message = %f.message, "preflight check failed");
            }
            return Err(EngineError::PreflightBlocked { findings });
        }
        let warnings = findings;
        for f in &warnings {
            warn!(check = %f.check_name, severity = %f.severity, message = %f.message, "preflight finding");
        }

        let session = Session::new(Uuid::new_v4().to_string(), plan, now());
        self.store.create_session(&session)?;
        let lease = self.take_lease(&session.id)?;
        info!(
            session_id = %session.id,
            steps = session.plan.steps.len(),
            "session started"
        );

        if let Err(e) = self.ensure_initial_backup(&session) {
            self.store
                .update_session_status(&session.id, SessionStatus::Failed, Some(&e.to_string()))?;
            return Err(e);
        }
        self.store
            .update_session_status(&session.id, SessionStatus::Running, None)?;

        let outcome = self.drive(&session.id, &lease, Mode::Automatic)?;
        lease.release()?;
        Ok(RunReport {
            session_id: session.id,
            outcome,
            warnings,
        })
    }

    /// Continue a session from what the store says happened.
    #[instrument(skip(self))]
    pub fn resume(&self, session_id: &str) -> Result<RunReport> {
        let (session, lease) = self.claim(
            session_id,
            "resume",
            &[SessionStatus::Pending, SessionStatus::Running, SessionStatus::Paused],
        )?;
        info!(status = %session.status, step = session.current_step_index, "resuming session");

        if session.backup_id.is_none() {
            self.ensure_initial_backup(&session)?;
        }
        if session.status != SessionStatus::Running {
            self.store
                .update_session_status(session_id, SessionStatus::Running, None)?;
        }

        let outcome = self.drive(session_id, &lease, Mode::Automatic)?;
        lease.release()?;
        Ok(self.report(session_id, outcome))
    }

    /// Answer a pending [`DecisionRequest`].
    #[instrument(skip(self))]
    pub fn decide(&self, session_id: &str, decision: Decision) -> Result<RunReport> {
        let (session, lease) = self.claim(session_id, "decide", &[SessionStatus::Paused])?;

        let pos = session.current_step_index as usize;
        let step = session.plan.steps.get(pos).cloned();
        let last = match &step {
            Some(step) => self
                .store
                .list_step_executions(session_id)?
                .into_iter()
                .filter(|e| e.step_index == step.index)
                .last(),
            None => None,
        };
        let (Some(step), Some(last)) = (step, last.filter(|e| e.status == StepStatus::Failed)) else {
            return Err(EngineError::InvalidState {
                session_id: session_id.to_string(),
                status: session.status.to_string(),
                action: "decide",
            });
        };
        info!(step_index = step.index, %decision, "operator decision");

        let outcome = match decision {
            Decision::Retry => {
                let mut grants = session.retry_grants.clone();
                *grants.entry(step.index).or_insert(0) += 1;
                self.store.save_retry_grants(session_id, &grants)?;
                self.store
                    .update_session_status(session_id, SessionStatus::Running, None)?;
                self.drive(session_id, &lease, Mode::Granted)?
            }
            Decision::Skip => {
                let at = now();
                let skipped = StepExecution::running(session_id, step.index, last.attempt_number + 1, at)
                    .finish(StepStatus::Skipped, "skipped by operator".to_string(), None, None, at);
                self.store.upsert_step_execution(&skipped)?;
                self.store.advance_step_index(session_id, pos as u32 + 1)?;
                self.store
                    .update_session_status(session_id, SessionStatus::Running, None)?;
                self.drive(session_id, &lease, Mode::Automatic)?
            }
            Decision::Rollback => {
                self.store
                    .update_session_status(session_id, SessionStatus::Running, None)?;
                let rollback = self.roll_back(session_id)?;
                self.store
                    .update_session_status(session_id, SessionStatus::RolledBack, None)?;
                RunOutcome::RolledBack { rollback }
            }
        };
        lease.release()?;
        Ok(self.report(session_id, outcome))
    }

    /// Roll a session back on operator request.
    #[instrument(skip(self))]
    pub fn rollback(&self, session_id: &str) -> Result<RunReport> {
        let (session, lease) = self.claim(
            session_id,
            "roll back",
            &[
                SessionStatus::Pending,
                SessionStatus::Running,
                SessionStatus::Paused,
                SessionStatus::Failed,
            ],
        )?;
        if session.status != SessionStatus::Running {
            self.store
                .update_session_status(session_id, SessionStatus::Running, session.last_error.as_deref())?;
        }
        let rollback = self.roll_back(session_id)?;
        self.store
            .update_session_status(session_id, SessionStatus::RolledBack, None)?;
        lease.release()?;
        Ok(self.report(session_id, RunOutcome::RolledBack { rollback }))
    }

    /// Take the lease, then check the session is in one of `allowed`.
    fn claim(
        &self,
        session_id: &str,
        action: &'static str,
        allowed: &[SessionStatus],
    ) -> Result<(Session, LeaseGuard)> {
        self.store.get_session(session_id)?;
        let lease = self.take_lease(session_id)?;
        let session = self.store.get_session(session_id)?;
        if !allowed.contains(&session.status) {
            return Err(EngineError::InvalidState {
                session_id: session_id.to_string(),
                status: session.status.to_string(),
                action,
            });
        }
        Ok((session, lease))
    }

    /// Acquire the session lease and keep its heartbeat fresh while held.
    fn take_lease(&self, session_id: &str) -> Result<LeaseGuard> {
        let ttl = self.config.lease_ttl();
        let mut lease = self.store.acquire_lease(session_id, ttl)?;
        lease.keep_alive(ttl / 3);
        Ok(lease)
    }

    fn ensure_initial_backup(&self, session: &Session) -> Result<()> {
        let label = format!("before plan '{}'", session.plan.title);
        let backup = self
            .backups()
            .create_backup(&label, Some(&session.id), &session.plan.backup_paths())?;
        self.store.set_session_backup(&session.id, &backup.id)
    }

    fn report(&self, session_id: &str, outcome: RunOutcome) -> RunReport {
        RunReport {
            session_id: session_id.to_string(),
            outcome,
            warnings: Vec::new(),
        }
    }
}
