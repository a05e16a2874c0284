//! Homestead execution and recovery engine
//!
//! Runs host setup plans (package installs, container deployments, service
//! configuration) as durable sessions that survive crashes, retry transient
//! failures, stop hammering a broken host and can be rolled back.

pub mod advisor;
pub mod breaker;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod plan;
pub mod preflight;
pub mod process_guard;
pub mod redact;
pub mod retry;
pub mod rollback;
pub mod runner;
pub mod session;
pub mod store;
pub mod verify;

// Re-export main types for convenience
pub use advisor::{HeuristicAdvisor, RecoveryAdvisor, Remediation, RemediationKind};
pub use breaker::{BreakerState, CircuitBreaker};
pub use config::{BreakerAction, EngineConfig, ResourceLimits};
pub use engine::{
    CancelToken, Decision, DecisionRequest, Engine, PauseReason, PrivilegeConfirmation,
    RunOutcome, RunReport,
};
pub use error::{EngineError, ErrorKind, StepFailure};
pub use plan::{Plan, Step, Verification};
pub use preflight::{Finding, HostPreflight, PreflightGate, Severity, StaticPreflight};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use rollback::{Backup, BackupStatus, RollbackManager, RollbackReport};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use session::{Session, SessionStatus, StepExecution, StepStatus};
pub use store::StateStore;
