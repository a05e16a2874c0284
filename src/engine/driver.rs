//! The step loop.
//!
//! Each pass re-reads the session from the store and works out the next
//! action from persisted rows alone, so a fresh process resuming a session
//! and a live loop continuing one take exactly the same path.

use super::{Engine, PauseReason, RunOutcome};
use super::outcome::DecisionRequest;
use crate::advisor::{Remediation, RemediationKind};
use crate::breaker::Admission;
use crate::config::BreakerAction;
use crate::error::{EngineError, ErrorKind, Result, StepFailure};
use crate::plan::Step;
use crate::redact;
use crate::retry::{Exhaustion, RetryDecision};
use crate::rollback::RollbackReport;
use crate::session::{Session, SessionStatus, StepExecution, StepStatus};
use crate::store::{LeaseGuard, now};
use crate::verify::{self, VerifyOutcome};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Mode {
    Automatic,
    /// The first attempt made is an operator-granted retry: no backoff, no
    /// budget and no breaker gate
    Granted,
}

enum Attempted {
    Succeeded,
    Failed(StepFailure),
}

impl Engine {
    pub(super) fn drive(&self, session_id: &str, lease: &LeaseGuard, mut mode: Mode) -> Result<RunOutcome> {
        let mut last_failure: Option<StepFailure> = None;
        loop {
            let session = self.store.get_session(session_id)?;
            let pos = session.current_step_index as usize;
            let Some(step) = session.plan.steps.get(pos).cloned() else {
                return self.finish(&session);
            };

            if self.cancel.is_cancelled() {
                self.cancel.reset();
                return self.pause(&session, PauseReason::Cancelled);
            }

            let attempts: Vec<StepExecution> = self
                .store
                .list_step_executions(session_id)?
                .into_iter()
                .filter(|e| e.step_index == step.index)
                .collect();

            if let Some(last) = attempts.last().filter(|e| e.status == StepStatus::Running) {
                warn!(
                    step_index = step.index,
                    attempt = last.attempt_number,
                    "unfinished attempt from an earlier run, recording it as failed"
                );
                let done = last.clone().finish(
                    StepStatus::Failed,
                    "interrupted before completion".to_string(),
                    Some(ErrorKind::CommandFailed),
                    None,
                    now(),
                );
                self.store.upsert_step_execution(&done)?;
                let mut breaker = session.breaker.clone();
                breaker.record_failure(now(), &self.config.breaker);
                self.store.save_breaker(session_id, &breaker)?;
                continue;
            }

            if let Some(status @ (StepStatus::Succeeded | StepStatus::Skipped)) =
                attempts.last().map(|e| e.status)
            {
                debug!(step_index = step.index, %status, "step already settled");
                self.store.advance_step_index(session_id, pos as u32 + 1)?;
                continue;
            }

            if step.requires_elevated_privileges && !self.is_confirmed(&session.plan.id, step.index) {
                warn!(step_index = step.index, step = %step.name, "privileged step not confirmed, pausing");
                return self.pause(
                    &session,
                    PauseReason::ConfirmationRequired {
                        step_index: step.index,
                    },
                );
            }

            let (attempt, delay, gated) = match (attempts.last(), mode) {
                (None, _) => (1, Duration::ZERO, true),
                (Some(last), Mode::Granted) => (last.attempt_number + 1, Duration::ZERO, false),
                (Some(last), Mode::Automatic) => {
                    let first_started_at = attempts[0].started_at;
                    match self.retry.next(
                        &step,
                        last.attempt_number,
                        session.granted_attempts(step.index),
                        first_started_at,
                        now(),
                        &mut rand::thread_rng(),
                    ) {
                        RetryDecision::RetryAfter { attempt, delay } => (attempt, delay, true),
                        RetryDecision::Exhausted(why) => {
                            let failure = last_failure
                                .take()
                                .filter(|f| f.step_index == step.index)
                                .unwrap_or_else(|| failure_from_row(&step, last));
                            return self.exhausted(&session, &step, last, failure, why);
                        }
                    }
                }
            };
            mode = Mode::Automatic;

            if gated {
                let mut breaker = session.breaker.clone();
                let admission = breaker.allow(now(), &self.config.breaker);
                if breaker != session.breaker {
                    self.store.save_breaker(session_id, &breaker)?;
                }
                if let Admission::Refused { retry_after } = admission {
                    return self.breaker_open(&session, retry_after);
                }
            }

            if !delay.is_zero() {
                info!(
                    step_index = step.index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "waiting before retry"
                );
                if self.cancel.wait_timeout(delay) {
                    self.cancel.reset();
                    return self.pause(&session, PauseReason::Cancelled);
                }
            }

            if attempt == 1 && step.risky {
                let label = format!("before step {} ({})", step.index, step.name);
                let backup = self
                    .backups()
                    .create_backup(&label, Some(session_id), &session.plan.backup_paths())?;
                info!(step_index = step.index, backup_id = %backup.id, "backup taken before risky step");
            }

            lease.heartbeat()?;
            let result = self.run_attempt(&session, &step, attempt)?;
            lease.heartbeat()?;

            let mut breaker = self.store.get_session(session_id)?.breaker;
            match result {
                Attempted::Succeeded => {
                    breaker.record_success();
                    self.store.save_breaker(session_id, &breaker)?;
                    self.store.advance_step_index(session_id, pos as u32 + 1)?;
                }
                Attempted::Failed(failure) => {
                    breaker.record_failure(now(), &self.config.breaker);
                    self.store.save_breaker(session_id, &breaker)?;
                    self.store.update_session_status(
                        session_id,
                        SessionStatus::Running,
                        Some(&failure.to_string()),
                    )?;
                    last_failure = Some(failure);
                }
            }
        }
    }

    /// One attempt: persist a running row, run, verify, persist the result.
    fn run_attempt(&self, session: &Session, step: &Step, attempt: u32) -> Result<Attempted> {
        let row = StepExecution::running(&session.id, step.index, attempt, now());
        self.store.upsert_step_execution(&row)?;

        let summary = redact::command_summary(&step.command);
        info!(
            session_id = %session.id,
            step_index = step.index,
            step = %step.name,
            attempt,
            command = %summary,
            "running step"
        );

        let (status, kind, exit_code, output, reason) = match self.runner.run(&step.command, step.timeout) {
            Err(e) => (
                StepStatus::Failed,
                Some(ErrorKind::CommandFailed),
                None,
                String::new(),
                redact::redact(&format!("could not run command: {e:#}")),
            ),
            Ok(out) if out.timed_out => (
                StepStatus::Failed,
                Some(ErrorKind::TimeoutExceeded),
                out.exit_code,
                out.combined(),
                out.failure_reason(step.timeout),
            ),
            Ok(out) if !out.success() => (
                StepStatus::Failed,
                Some(ErrorKind::CommandFailed),
                out.exit_code,
                out.combined(),
                out.failure_reason(step.timeout),
            ),
            Ok(out) => match verify::evaluate(&step.verification, &out, self.runner.as_ref()) {
                VerifyOutcome::Pass => (StepStatus::Succeeded, None, out.exit_code, out.combined(), String::new()),
                VerifyOutcome::Fail(reason) => (
                    StepStatus::Failed,
                    Some(ErrorKind::VerificationFailed),
                    out.exit_code,
                    out.combined(),
                    reason,
                ),
            },
        };

        let excerpt = redact::excerpt(&output, self.config.output_excerpt_bytes);
        let done = row.finish(status, excerpt, kind, exit_code, now());
        self.store.upsert_step_execution(&done)?;

        match kind {
            None => {
                info!(step_index = step.index, attempt, "step succeeded");
                Ok(Attempted::Succeeded)
            }
            Some(kind) => {
                let failure = StepFailure {
                    kind,
                    step_index: step.index,
                    step_name: step.name.clone(),
                    command_summary: summary,
                    reason,
                };
                warn!(
                    step_index = step.index,
                    attempt,
                    reason_code = kind.reason_code(),
                    reason = %failure.reason,
                    "step attempt failed"
                );
                Ok(Attempted::Failed(failure))
            }
        }
    }

    /// No automatic attempt is left for `step`.
    fn exhausted(
        &self,
        session: &Session,
        step: &Step,
        last: &StepExecution,
        failure: StepFailure,
        why: Exhaustion,
    ) -> Result<RunOutcome> {
        let remediations = self.advise(step, &failure, &last.output_excerpt);

        if step.rollback_command.is_some() {
            warn!(step_index = step.index, %why, "step exhausted, operator decision required");
            self.store
                .update_session_status(&session.id, SessionStatus::Paused, Some(&failure.to_string()))?;
            return Ok(RunOutcome::DecisionRequired(DecisionRequest {
                attempts: last.attempt_number,
                exhaustion: why.to_string(),
                error_hint: step.error_hint.clone(),
                remediations,
                failure,
            }));
        }

        error!(
            step_index = step.index,
            %why,
            "step exhausted and cannot be undone, rolling back the session"
        );
        let rollback = self.roll_back(&session.id)?;
        self.store
            .update_session_status(&session.id, SessionStatus::Failed, Some(&failure.to_string()))?;
        Ok(RunOutcome::Failed {
            failure,
            rollback,
            remediations,
        })
    }

    fn breaker_open(&self, session: &Session, retry_after: DateTime<Utc>) -> Result<RunOutcome> {
        match self.config.breaker.on_open {
            BreakerAction::Pause => self.pause(session, PauseReason::BreakerOpen { retry_after }),
            BreakerAction::Rollback => {
                warn!(session_id = %session.id, "circuit breaker open, rolling back as configured");
                let rollback = self.roll_back(&session.id)?;
                self.store
                    .update_session_status(&session.id, SessionStatus::RolledBack, None)?;
                Ok(RunOutcome::RolledBack { rollback })
            }
        }
    }

    fn pause(&self, session: &Session, reason: PauseReason) -> Result<RunOutcome> {
        info!(session_id = %session.id, %reason, "session paused");
        self.store
            .update_session_status(&session.id, SessionStatus::Paused, Some(&reason.to_string()))?;
        Ok(RunOutcome::Paused { reason })
    }

    /// Every step has been handled; decide between completed and skipped.
    fn finish(&self, session: &Session) -> Result<RunOutcome> {
        let latest = self.store.latest_step_executions(&session.id)?;
        let mut skipped = Vec::new();
        for step in &session.plan.steps {
            match latest.get(&step.index).map(|e| e.status) {
                Some(StepStatus::Succeeded) => {}
                Some(StepStatus::Skipped) => skipped.push(step.index),
                other => {
                    return Err(EngineError::integrity(format!(
                        "session {}: step {} is behind the cursor but its latest attempt is {:?}",
                        session.id, step.index, other
                    )));
                }
            }
        }

        if skipped.is_empty() {
            self.store
                .update_session_status(&session.id, SessionStatus::Completed, None)?;
            info!(session_id = %session.id, "session completed");
            return Ok(RunOutcome::Completed);
        }

        let note = format!(
            "finished with skipped steps: {}",
            skipped.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
        );
        warn!(session_id = %session.id, "{note}");
        self.store
            .update_session_status(&session.id, SessionStatus::Failed, Some(&note))?;
        Ok(RunOutcome::FinishedWithSkips { skipped })
    }

    /// Run the rollback manager. A blocked rollback leaves the session failed.
    pub(super) fn roll_back(&self, session_id: &str) -> Result<RollbackReport> {
        let session = self.store.get_session(session_id)?;
        match self.backups().restore(&session) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.store
                    .update_session_status(session_id, SessionStatus::Failed, Some(&e.to_string()))?;
                Err(e)
            }
        }
    }

    fn advise(&self, step: &Step, failure: &StepFailure, output: &str) -> Vec<Remediation> {
        let mut out = Vec::new();
        if let Some(hint) = &step.error_hint {
            out.push(Remediation::new(RemediationKind::Manual, hint.clone()));
        }
        for advisor in &self.advisors {
            out.extend(advisor.advise(failure, output));
        }
        out
    }
}

/// Rebuild a failure description from a persisted attempt row.
fn failure_from_row(step: &Step, row: &StepExecution) -> StepFailure {
    let kind = row.error_kind.unwrap_or(ErrorKind::CommandFailed);
    let reason = match (kind, row.exit_code) {
        (ErrorKind::TimeoutExceeded, _) => format!("timed out after {}s", step.timeout.as_secs()),
        (ErrorKind::VerificationFailed, _) => "verification did not pass".to_string(),
        (_, Some(code)) => format!("exit code {code}"),
        (_, None) => row
            .output_excerpt
            .lines()
            .last()
            .unwrap_or("terminated before exit")
            .to_string(),
    };
    StepFailure {
        kind,
        step_index: step.index,
        step_name: step.name.clone(),
        command_summary: redact::command_summary(&step.command),
        reason,
    }
}
