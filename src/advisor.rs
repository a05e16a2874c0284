//! Recovery suggestions for failed steps.
//!
//! Advisors only return data; nothing here executes a remediation.

use crate::error::{ErrorKind, StepFailure};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RemediationKind {
    RetryLater,
    RunCommand,
    InstallDependency,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remediation {
    pub kind: RemediationKind,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl Remediation {
    pub fn new(kind: RemediationKind, summary: impl Into<String>) -> Self {
        Self {
            kind,
            summary: summary.into(),
            command: None,
        }
    }

    pub fn with_command(mut self, argv: &[&str]) -> Self {
        self.command = Some(argv.iter().map(|s| s.to_string()).collect());
        self
    }
}

pub trait RecoveryAdvisor: Send + Sync {
    fn advise(&self, failure: &StepFailure, output: &str) -> Vec<Remediation>;
}

struct Rule {
    needles: &'static [&'static str],
    kind: RemediationKind,
    summary: &'static str,
    command: Option<&'static [&'static str]>,
}

const RULES: &[Rule] = &[
    Rule {
        needles: &["command not found", "no such file or directory"],
        kind: RemediationKind::InstallDependency,
        summary: "A required program is missing; install the package that provides it",
        command: None,
    },
    Rule {
        needles: &["cannot connect to the docker daemon", "is the docker daemon running"],
        kind: RemediationKind::RunCommand,
        summary: "The Docker daemon is not running; start it and retry",
        command: Some(&["systemctl", "start", "docker"]),
    },
    Rule {
        needles: &["permission denied"],
        kind: RemediationKind::Manual,
        summary: "Permission denied; run with elevated privileges or fix ownership (for Docker, add the user to the docker group)",
        command: None,
    },
    Rule {
        needles: &[
            "could not resolve host",
            "temporary failure in name resolution",
            "connection refused",
            "connection timed out",
            "network is unreachable",
        ],
        kind: RemediationKind::RetryLater,
        summary: "Network problem; check connectivity and retry",
        command: None,
    },
    Rule {
        needles: &["no space left on device", "disk full"],
        kind: RemediationKind::Manual,
        summary: "The disk is full; free space (df -h, docker system prune) before continuing",
        command: None,
    },
    Rule {
        needles: &["could not get lock", "unable to acquire the dpkg frontend lock"],
        kind: RemediationKind::RetryLater,
        summary: "Another package manager is running; wait for it to finish and retry",
        command: None,
    },
    Rule {
        needles: &["unable to locate package"],
        kind: RemediationKind::RunCommand,
        summary: "Package lists are stale; refresh them and retry",
        command: Some(&["apt-get", "update"]),
    },
    Rule {
        needles: &["broken packages", "unmet dependencies"],
        kind: RemediationKind::RunCommand,
        summary: "Package dependencies are broken; let apt repair them",
        command: Some(&["apt-get", "--fix-broken", "install", "-y"]),
    },
    Rule {
        needles: &["address already in use", "port is already allocated"],
        kind: RemediationKind::Manual,
        summary: "A port the service needs is taken; stop the other listener (ss -ltnp) or change the port",
        command: None,
    },
    Rule {
        needles: &["container name", "is already in use"],
        kind: RemediationKind::Manual,
        summary: "A container with this name already exists; remove it or pick another name",
        command: None,
    },
];

/// Matches output against known failure signatures.
#[derive(Debug, Clone, Default)]
pub struct HeuristicAdvisor;

impl RecoveryAdvisor for HeuristicAdvisor {
    fn advise(&self, failure: &StepFailure, output: &str) -> Vec<Remediation> {
        let haystack = format!("{}\n{}", failure.reason, output).to_lowercase();
        let mut out: Vec<Remediation> = RULES
            .iter()
            .filter(|rule| rule.needles.iter().any(|n| haystack.contains(n)))
            .map(|rule| Remediation {
                kind: rule.kind,
                summary: rule.summary.to_string(),
                command: rule.command.map(|c| c.iter().map(|s| s.to_string()).collect()),
            })
            .collect();

        if out.is_empty() && failure.kind == ErrorKind::TimeoutExceeded {
            out.push(Remediation::new(
                RemediationKind::RetryLater,
                "The step timed out; retry, or raise its timeout if it is legitimately slow",
            ));
        }
        if out.is_empty() {
            out.push(Remediation::new(
                RemediationKind::Manual,
                "Unrecognized failure; inspect the output, then retry, skip or roll back",
            ));
        }
        out
    }
}
