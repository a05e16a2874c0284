//! What the engine hands back to its caller.

use crate::advisor::Remediation;
use crate::error::StepFailure;
use crate::plan::{Plan, Verification};
use crate::preflight::Finding;
use crate::redact;
use crate::rollback::RollbackReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Result of `start`, `resume`, `decide` or `rollback`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub session_id: String,
    pub outcome: RunOutcome,
    /// Non-blocking preflight findings
    pub warnings: Vec<Finding>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// Every step was handled but at least one was skipped by the operator
    FinishedWithSkips { skipped: Vec<u32> },
    Paused { reason: PauseReason },
    /// A step with a rollback command ran out of attempts
    DecisionRequired(DecisionRequest),
    /// A step without a rollback command ran out of attempts; the rest of the
    /// session was rolled back automatically
    Failed {
        failure: StepFailure,
        rollback: RollbackReport,
        remediations: Vec<Remediation>,
    },
    RolledBack { rollback: RollbackReport },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PauseReason {
    Cancelled,
    BreakerOpen { retry_after: DateTime<Utc> },
    ConfirmationRequired { step_index: u32 },
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PauseReason::Cancelled => write!(f, "cancelled by request"),
            PauseReason::BreakerOpen { retry_after } => write!(
                f,
                "circuit breaker open until {}",
                retry_after.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            PauseReason::ConfirmationRequired { step_index } => write!(
                f,
                "step {step_index} requires elevated privileges and was not confirmed"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRequest {
    pub failure: StepFailure,
    pub attempts: u32,
    /// Why no further automatic attempt is made
    pub exhaustion: String,
    pub error_hint: Option<String>,
    pub remediations: Vec<Remediation>,
}

/// The operator's answer to a [`DecisionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    /// One more attempt, run immediately
    Retry,
    /// Roll the session back, starting with the failed step
    Rollback,
    /// Record the step as skipped and carry on
    Skip,
}

/// Operator consent to run a plan's privileged steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrivilegeConfirmation {
    plan_id: String,
    steps: Vec<u32>,
}

impl PrivilegeConfirmation {
    /// Confirm every privileged step currently in `plan`.
    pub fn for_plan(plan: &Plan) -> Self {
        Self {
            plan_id: plan.id.clone(),
            steps: plan
                .steps
                .iter()
                .filter(|s| s.requires_elevated_privileges)
                .map(|s| s.index)
                .collect(),
        }
    }

    pub fn covers(&self, plan_id: &str, step_index: u32) -> bool {
        self.plan_id == plan_id && self.steps.contains(&step_index)
    }
}

/// Dry-run view of one step. Commands are redacted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewStep {
    pub index: u32,
    pub name: String,
    pub command: String,
    pub verification: String,
    pub rollback: Option<String>,
    pub privileged: bool,
    pub risky: bool,
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preview {
    pub plan_id: String,
    pub title: String,
    pub steps: Vec<PreviewStep>,
    pub findings: Vec<Finding>,
}

impl PreviewStep {
    pub(crate) fn from_step(step: &crate::plan::Step) -> Self {
        Self {
            index: step.index,
            name: step.name.clone(),
            command: redact::command_summary(&step.command),
            verification: describe_verification(&step.verification),
            rollback: step.rollback_command.as_deref().map(redact::command_summary),
            privileged: step.requires_elevated_privileges,
            risky: step.risky,
            max_attempts: step.max_attempts(),
            timeout_secs: step.timeout.as_secs(),
        }
    }
}

fn describe_verification(check: &Verification) -> String {
    match check {
        Verification::Command { argv, expect_output, .. } => match expect_output {
            Some(expected) => format!(
                "`{}` prints {:?}",
                redact::command_summary(argv),
                redact::redact(expected)
            ),
            None => format!("`{}` exits 0", redact::command_summary(argv)),
        },
        Verification::PathExists { path } => format!("{} exists", path.display()),
        Verification::FileContains { path, needle } => {
            format!("{} contains {:?}", path.display(), redact::redact(needle))
        }
        Verification::OutputContains { needle } => {
            format!("output contains {:?}", redact::redact(needle))
        }
        Verification::All { checks } => checks
            .iter()
            .map(describe_verification)
            .collect::<Vec<_>>()
            .join(" and "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::{plan, step};

    #[test]
    fn test_confirmation_is_bound_to_plan_and_step() {
        let mut privileged = step(2, "install docker");
        privileged.requires_elevated_privileges = true;
        let p = plan(vec![step(1, "check"), privileged]);
        let token = PrivilegeConfirmation::for_plan(&p);
        assert!(token.covers("test-plan", 2));
        assert!(!token.covers("test-plan", 1));
        assert!(!token.covers("other-plan", 2));
    }

    #[test]
    fn test_preview_redacts_commands() {
        let mut s = step(1, "login");
        s.command = vec![
            "docker".into(),
            "login".into(),
            "--password".into(),
            "password=hunter2".into(),
        ];
        let preview = PreviewStep::from_step(&s);
        assert!(!preview.command.contains("hunter2"));
        assert_eq!(preview.verification, "`true` exits 0");
    }

    #[test]
    fn test_decision_parses() {
        assert_eq!("skip".parse::<Decision>().expect("parse"), Decision::Skip);
        assert_eq!(Decision::Rollback.to_string(), "rollback");
    }
}
