//! Go/no-go checks run before a session is created.
//!
//! Any finding with [`Severity::Error`] blocks `Engine::start`; warnings are
//! logged and returned with the run report.

use crate::plan::Plan;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub check_name: String,
    pub severity: Severity,
    pub message: String,
    pub suggested_fix: String,
}

impl Finding {
    pub fn new(
        check_name: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
        suggested_fix: impl Into<String>,
    ) -> Self {
        Self {
            check_name: check_name.into(),
            severity,
            message: message.into(),
            suggested_fix: suggested_fix.into(),
        }
    }

    #[inline]
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Error
    }
}

pub trait PreflightGate: Send + Sync {
    fn check(&self, plan: &Plan) -> Vec<Finding>;
}

/// Fixed findings, for embedding callers that run their own checks.
#[derive(Debug, Clone, Default)]
pub struct StaticPreflight {
    findings: Vec<Finding>,
}

impl StaticPreflight {
    pub fn new(findings: Vec<Finding>) -> Self {
        Self { findings }
    }

    pub fn pass() -> Self {
        Self::default()
    }
}

impl PreflightGate for StaticPreflight {
    fn check(&self, _plan: &Plan) -> Vec<Finding> {
        self.findings.clone()
    }
}

/// Checks the local host can run the plan at all.
#[derive(Debug, Clone)]
pub struct HostPreflight {
    writable_dirs: Vec<PathBuf>,
    require_root_for_privileged: bool,
}

impl HostPreflight {
    pub fn new(writable_dirs: Vec<PathBuf>) -> Self {
        Self {
            writable_dirs,
            require_root_for_privileged: true,
        }
    }

    /// Report missing root as a warning instead of an error (steps may use sudo).
    pub fn allow_non_root(mut self) -> Self {
        self.require_root_for_privileged = false;
        self
    }
}

impl PreflightGate for HostPreflight {
    fn check(&self, plan: &Plan) -> Vec<Finding> {
        let mut findings = Vec::new();

        let mut seen = std::collections::HashSet::new();
        for step in &plan.steps {
            let Some(program) = step.command.first() else {
                continue;
            };
            if !seen.insert(program.as_str()) {
                continue;
            }
            if find_binary(program).is_none() {
                findings.push(Finding::new(
                    "binary_on_path",
                    Severity::Error,
                    format!("`{}` (step {}: {}) was not found", program, step.index, step.name),
                    format!("Install the package that provides `{program}` or fix PATH"),
                ));
            }
        }

        if plan.has_privileged_steps() && !nix::unistd::geteuid().is_root() {
            let severity = if self.require_root_for_privileged {
                Severity::Error
            } else {
                Severity::Warning
            };
            findings.push(Finding::new(
                "root_privileges",
                severity,
                "plan contains privileged steps but the engine is not running as root",
                "Run with sudo or as root",
            ));
        }

        for dir in &self.writable_dirs {
            if let Err(reason) = check_writable(dir) {
                findings.push(Finding::new(
                    "writable_dir",
                    Severity::Error,
                    format!("{} is not writable: {}", dir.display(), reason),
                    format!("Create {} or fix its permissions", dir.display()),
                ));
            }
        }

        debug!(count = findings.len(), "host preflight finished");
        findings
    }
}

/// Resolve `program` the way `execvp` would.
pub fn find_binary(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Create `dir` if needed and prove we can write into it.
fn check_writable(dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
    let probe = dir.join(format!(".homestead-probe-{}", std::process::id()));
    std::fs::write(&probe, b"").map_err(|e| e.to_string())?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::{plan, step};

    #[test]
    fn test_find_binary() {
        assert!(find_binary("sh").is_some());
        assert!(find_binary("this_binary_definitely_does_not_exist_12345").is_none());
        assert!(find_binary("/bin/sh").is_some());
    }

    #[test]
    fn test_missing_binary_blocks() {
        let mut s = step(0, "install");
        s.command = vec!["this_binary_definitely_does_not_exist_12345".to_string()];
        let findings = HostPreflight::new(vec![]).check(&plan(vec![s]));
        assert_eq!(findings.len(), 1);
        assert!(findings[0].is_blocking());
        assert_eq!(findings[0].check_name, "binary_on_path");
    }

    #[test]
    fn test_writable_dir_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gate = HostPreflight::new(vec![dir.path().join("state")]);
        assert!(gate.check(&plan(vec![step(0, "a")])).is_empty());
        assert!(dir.path().join("state").is_dir());
    }

    #[test]
    fn test_static_preflight() {
        let gate = StaticPreflight::new(vec![Finding::new("x", Severity::Warning, "w", "")]);
        let findings = gate.check(&plan(vec![step(0, "a")]));
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].is_blocking());
        assert!(StaticPreflight::pass().check(&plan(vec![])).is_empty());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Error > Severity::Warning);
        assert_eq!(Severity::Warning.to_string(), "warning");
    }
}
