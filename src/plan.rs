//! Plan and Step model
//!
//! A [`Plan`] is the immutable, fully-resolved description of the work to do:
//! an ordered list of [`Step`] records. The engine never cares where a plan
//! came from (template generator or planner); it only requires that the plan
//! passes [`Plan::validate`] before anything is executed.
//!
//! # Plan Format
//!
//! Plans are JSON documents:
//! ```json
//! {
//!   "id": "media-server",
//!   "title": "Jellyfin + AdGuard",
//!   "created_at": "2026-10-19T08:00:00Z",
//!   "steps": [
//!     {
//!       "index": 0,
//!       "name": "Install curl",
//!       "command": ["apt-get", "install", "-y", "curl"],
//!       "verification": { "kind": "command", "argv": ["curl", "--version"] },
//!       "rollback_command": ["apt-get", "remove", "-y", "curl"],
//!       "requires_elevated_privileges": true,
//!       "retryable": true,
//!       "max_retries": 2,
//!       "timeout_secs": 300
//!     }
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for a single step's timeout (one hour).
pub const MAX_STEP_TIMEOUT: Duration = Duration::from_secs(3600);

/// Upper bound for `max_retries` on any step.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Block device names a plan must never write to directly.
const BLOCK_DEVICE: &str = r"/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|mmcblk\d)";

/// End of a path argument: whitespace, a shell separator, a quote or the end.
const PATH_END: &str = r#"(?:$|[\s;&|"'])"#;

/// Host-destroying command shapes, matched against the space-joined argv.
/// Each entry carries a short label used in the validation error.
static DANGEROUS_COMMANDS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        (
            "recursive delete of /",
            format!(r"\brm\s+(?:-[a-zA-Z]*\s+)*-[a-zA-Z]*(?:r[a-zA-Z]*f|f[a-zA-Z]*r)[a-zA-Z]*\s+(?:--no-preserve-root\s+)?/\*?{PATH_END}"),
        ),
        ("filesystem creation", r"(?:^|[\s;&|(])mkfs(?:\.[a-z0-9]+)?(?:\s|$)".to_string()),
        ("raw write to a block device", format!(r"\bdd\b.*\bof={BLOCK_DEVICE}")),
        ("redirect onto a block device", format!(r">\s*{BLOCK_DEVICE}")),
        ("shred of a block device", format!(r"\bshred\b.*\s{BLOCK_DEVICE}")),
        ("fork bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:".to_string()),
        ("move of / to /dev/null", r"\bmv\s+/\*?\s+/dev/null".to_string()),
        (
            "world-writable /",
            format!(r"\bchmod\s+(?:-[a-zA-Z]*R[a-zA-Z]*\s+)+0?777\s+/\*?{PATH_END}"),
        ),
    ]
    .into_iter()
    .map(|(label, pattern)| {
        (
            label,
            Regex::new(&pattern).expect("dangerous command patterns are valid"),
        )
    })
    .collect()
});

/// Label of the first dangerous shape `argv` matches, if any.
pub fn dangerous_pattern(argv: &[String]) -> Option<&'static str> {
    let joined = argv.join(" ");
    DANGEROUS_COMMANDS
        .iter()
        .find(|(_, re)| re.is_match(&joined))
        .map(|(label, _)| *label)
}

/// Errors found while validating a plan
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Plan '{plan_id}' has no steps")]
    Empty { plan_id: String },

    #[error("Plan id must not be blank")]
    BlankId,

    #[error("Step {index} ({name}) has an empty command vector")]
    EmptyCommand { index: u32, name: String },

    #[error("Step {index} ({name}) has an empty {field}")]
    EmptyArgv {
        index: u32,
        name: String,
        field: &'static str,
    },

    #[error("Duplicate step index {index}")]
    DuplicateIndex { index: u32 },

    #[error("Step index {index} appears after {previous}; indices must increase in plan order")]
    OutOfOrder { index: u32, previous: u32 },

    #[error("Step {index} ({name}) {field} is refused as a {pattern}")]
    DangerousCommand {
        index: u32,
        name: String,
        field: &'static str,
        pattern: &'static str,
    },

    #[error("Step {index} ({name}): {reason}")]
    InvalidStep {
        index: u32,
        name: String,
        reason: String,
    },
}

/// Immutable, ordered list of steps to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub title: String,
    pub steps: Vec<Step>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// One unit of work: a command, its verification, and an optional undo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Argument vector, never a shell string.
    pub command: Vec<String>,
    pub verification: Verification,
    #[serde(default)]
    pub rollback_command: Option<Vec<String>>,
    /// Checked after `rollback_command`; exit status alone is used when absent.
    #[serde(default)]
    pub rollback_verification: Option<Verification>,
    #[serde(default)]
    pub requires_elevated_privileges: bool,
    #[serde(default = "default_true")]
    pub retryable: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(rename = "timeout_secs", with = "duration_secs", default = "default_timeout")]
    pub timeout: Duration,
    /// Take an extra backup right before this step runs.
    #[serde(default)]
    pub risky: bool,
    /// Files or directories this step mutates.
    #[serde(default)]
    pub backup_paths: Vec<PathBuf>,
    #[serde(default)]
    pub error_hint: Option<String>,
}

/// A check that decides whether a step actually took effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verification {
    /// Run a secondary command; passes on exit 0 (and expected output if given).
    Command {
        argv: Vec<String>,
        #[serde(default)]
        expect_output: Option<String>,
        #[serde(default = "default_verify_timeout_secs")]
        timeout_secs: u64,
    },
    PathExists {
        path: PathBuf,
    },
    FileContains {
        path: PathBuf,
        needle: String,
    },
    /// The step command's own stdout contains `needle`.
    OutputContains {
        needle: String,
    },
    All {
        checks: Vec<Verification>,
    },
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_verify_timeout_secs() -> u64 {
    30
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl Plan {
    /// Load a plan from a JSON file. Does not validate.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read plan from {:?}", path.as_ref()))?;
        serde_json::from_str(&content).context("Failed to parse plan JSON")
    }

    /// Save the plan as pretty-printed JSON.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize plan")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write plan to {:?}", path.as_ref()))
    }

    /// Check the plan's shape. Nothing is spawned.
    pub fn validate(&self) -> std::result::Result<(), PlanError> {
        if self.id.trim().is_empty() {
            return Err(PlanError::BlankId);
        }
        if self.steps.is_empty() {
            return Err(PlanError::Empty {
                plan_id: self.id.clone(),
            });
        }

        let mut seen = HashSet::with_capacity(self.steps.len());
        let mut previous: Option<u32> = None;
        for step in &self.steps {
            if !seen.insert(step.index) {
                return Err(PlanError::DuplicateIndex { index: step.index });
            }
            if let Some(prev) = previous {
                if step.index < prev {
                    return Err(PlanError::OutOfOrder {
                        index: step.index,
                        previous: prev,
                    });
                }
            }
            previous = Some(step.index);
            step.validate()?;
        }
        Ok(())
    }

    /// Position of the step with the given index in plan order.
    pub fn position_of(&self, index: u32) -> Option<usize> {
        self.steps.iter().position(|s| s.index == index)
    }

    pub fn step(&self, index: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.index == index)
    }

    pub fn has_privileged_steps(&self) -> bool {
        self.steps.iter().any(|s| s.requires_elevated_privileges)
    }

    /// Union of every step's backup paths, in first-seen order.
    pub fn backup_paths(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        self.steps
            .iter()
            .flat_map(|s| s.backup_paths.iter())
            .filter(|p| seen.insert((*p).clone()))
            .cloned()
            .collect()
    }
}

impl Step {
    /// Total attempts the retry policy may make for this step.
    pub fn max_attempts(&self) -> u32 {
        if self.retryable {
            self.max_retries + 1
        } else {
            1
        }
    }

    fn validate(&self) -> std::result::Result<(), PlanError> {
        if self.command.is_empty() {
            return Err(PlanError::EmptyCommand {
                index: self.index,
                name: self.name.clone(),
            });
        }
        if self.command[0].trim().is_empty() {
            return Err(self.invalid("command program (argv[0]) is blank"));
        }
        if self.name.trim().is_empty() {
            return Err(self.invalid("name must not be blank"));
        }
        if let Some(rollback) = &self.rollback_command {
            if rollback.is_empty() || rollback[0].trim().is_empty() {
                return Err(PlanError::EmptyArgv {
                    index: self.index,
                    name: self.name.clone(),
                    field: "rollback_command",
                });
            }
        }
        self.refuse_dangerous(&self.command, "command")?;
        if let Some(rollback) = &self.rollback_command {
            self.refuse_dangerous(rollback, "rollback_command")?;
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(self.invalid(format!(
                "max_retries {} exceeds the limit of {}",
                self.max_retries, MAX_RETRIES_LIMIT
            )));
        }
        if self.timeout.is_zero() || self.timeout > MAX_STEP_TIMEOUT {
            return Err(self.invalid(format!(
                "timeout must be between 1s and {}s",
                MAX_STEP_TIMEOUT.as_secs()
            )));
        }
        self.validate_verification(&self.verification, "verification")?;
        if let Some(check) = &self.rollback_verification {
            self.validate_verification(check, "rollback_verification")?;
        }
        Ok(())
    }

    fn validate_verification(
        &self,
        check: &Verification,
        field: &'static str,
    ) -> std::result::Result<(), PlanError> {
        match check {
            Verification::Command {
                argv, timeout_secs, ..
            } => {
                if argv.is_empty() || argv[0].trim().is_empty() {
                    return Err(PlanError::EmptyArgv {
                        index: self.index,
                        name: self.name.clone(),
                        field,
                    });
                }
                if *timeout_secs == 0 || *timeout_secs > MAX_STEP_TIMEOUT.as_secs() {
                    return Err(self.invalid(format!("{field} timeout_secs is out of range")));
                }
            }
            Verification::PathExists { path } | Verification::FileContains { path, .. } => {
                if path.as_os_str().is_empty() {
                    return Err(self.invalid(format!("{field} path is empty")));
                }
            }
            Verification::OutputContains { needle } => {
                if needle.is_empty() {
                    return Err(self.invalid(format!("{field} needle is empty")));
                }
            }
            Verification::All { checks } => {
                if checks.is_empty() {
                    return Err(self.invalid(format!("{field} has no nested checks")));
                }
                for nested in checks {
                    self.validate_verification(nested, field)?;
                }
            }
        }
        Ok(())
    }

    fn refuse_dangerous(&self, argv: &[String], field: &'static str) -> std::result::Result<(), PlanError> {
        match dangerous_pattern(argv) {
            Some(pattern) => Err(PlanError::DangerousCommand {
                index: self.index,
                name: self.name.clone(),
                field,
                pattern,
            }),
            None => Ok(()),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> PlanError {
        PlanError::InvalidStep {
            index: self.index,
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}
