//! Step verification
//!
//! A step only counts as applied when its [`Verification`] passes; a zero
//! exit status is necessary but not sufficient.

use crate::plan::Verification;
use crate::redact;
use crate::runner::{CommandOutput, CommandRunner};
use std::fs;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Pass,
    Fail(String),
}

impl VerifyOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, VerifyOutcome::Pass)
    }
}

/// Evaluate `check` against the host and the step command's own output.
pub fn evaluate(
    check: &Verification,
    step_output: &CommandOutput,
    runner: &dyn CommandRunner,
) -> VerifyOutcome {
    let outcome = match check {
        Verification::Command {
            argv,
            expect_output,
            timeout_secs,
        } => match runner.run(argv, Duration::from_secs(*timeout_secs)) {
            Err(e) => VerifyOutcome::Fail(format!(
                "check command `{}` could not run: {}",
                redact::command_summary(argv),
                redact::redact(&format!("{e:#}"))
            )),
            Ok(out) if !out.success() => VerifyOutcome::Fail(format!(
                "check command `{}` failed: {}",
                redact::command_summary(argv),
                out.failure_reason(Duration::from_secs(*timeout_secs))
            )),
            Ok(out) => match expect_output {
                Some(expected) if !out.stdout.contains(expected.as_str()) => {
                    VerifyOutcome::Fail(format!(
                        "check command output does not contain {:?}",
                        redact::redact(expected)
                    ))
                }
                _ => VerifyOutcome::Pass,
            },
        },
        Verification::PathExists { path } => {
            if path.exists() {
                VerifyOutcome::Pass
            } else {
                VerifyOutcome::Fail(format!("{} does not exist", path.display()))
            }
        }
        Verification::FileContains { path, needle } => match fs::read_to_string(path) {
            Ok(content) if content.contains(needle.as_str()) => VerifyOutcome::Pass,
            Ok(_) => VerifyOutcome::Fail(format!(
                "{} does not contain {:?}",
                path.display(),
                redact::redact(needle)
            )),
            Err(e) => VerifyOutcome::Fail(format!("cannot read {}: {}", path.display(), e)),
        },
        Verification::OutputContains { needle } => {
            if step_output.stdout.contains(needle.as_str()) {
                VerifyOutcome::Pass
            } else {
                VerifyOutcome::Fail(format!(
                    "command output does not contain {:?}",
                    redact::redact(needle)
                ))
            }
        }
        Verification::All { checks } => checks
            .iter()
            .map(|c| evaluate(c, step_output, runner))
            .find(|o| !o.passed())
            .unwrap_or(VerifyOutcome::Pass),
    };
    debug!(passed = outcome.passed(), "verification evaluated");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ProcessRunner;
    use std::path::PathBuf;

    fn out(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            ..CommandOutput::default()
        }
    }

    fn cmd(parts: &[&str], expect: Option<&str>) -> Verification {
        Verification::Command {
            argv: parts.iter().map(|s| s.to_string()).collect(),
            expect_output: expect.map(str::to_string),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_command_check_exit_status() {
        let runner = ProcessRunner::default();
        assert!(evaluate(&cmd(&["true"], None), &out(""), &runner).passed());
        let fail = evaluate(&cmd(&["false"], None), &out(""), &runner);
        assert!(matches!(fail, VerifyOutcome::Fail(ref r) if r.contains("exit code 1")));
    }

    #[test]
    fn test_command_check_expected_output() {
        let runner = ProcessRunner::default();
        let check = cmd(&["echo", "Docker version 27"], Some("Docker version"));
        assert!(evaluate(&check, &out(""), &runner).passed());
        let check = cmd(&["echo", "nope"], Some("Docker version"));
        assert!(!evaluate(&check, &out(""), &runner).passed());
    }

    #[test]
    fn test_file_checks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("daemon.json");
        fs::write(&path, r#"{"log-driver":"json-file"}"#).expect("write");
        let runner = ProcessRunner::default();

        let exists = Verification::PathExists { path: path.clone() };
        assert!(evaluate(&exists, &out(""), &runner).passed());

        let missing = Verification::PathExists {
            path: PathBuf::from("/nonexistent/xyz"),
        };
        assert!(!evaluate(&missing, &out(""), &runner).passed());

        let contains = Verification::FileContains {
            path,
            needle: "json-file".to_string(),
        };
        assert!(evaluate(&contains, &out(""), &runner).passed());
    }

    #[test]
    fn test_output_contains_and_all() {
        let runner = ProcessRunner::default();
        let check = Verification::All {
            checks: vec![
                Verification::OutputContains {
                    needle: "active".to_string(),
                },
                Verification::OutputContains {
                    needle: "running".to_string(),
                },
            ],
        };
        assert!(evaluate(&check, &out("active (running)"), &runner).passed());
        let fail = evaluate(&check, &out("active (exited)"), &runner);
        assert!(matches!(fail, VerifyOutcome::Fail(ref r) if r.contains("running")));
    }
}
