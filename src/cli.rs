use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::engine::Decision;
use crate::session::SessionStatus;

/// Homestead - resumable, recoverable host setup
#[derive(Parser)]
#[command(name = "homestead")]
#[command(about = "Run host setup plans as durable sessions with retry and rollback")]
#[command(version)]
pub struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// State database path; overrides the config file and HOMESTEAD_STATE_DB
    #[arg(long, global = true)]
    pub state_db: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a plan file without running anything
    Validate {
        /// Path to the plan (JSON)
        plan: PathBuf,
    },
    /// Show the redacted commands a plan would run, plus preflight findings
    Preview {
        plan: PathBuf,
    },
    /// Start a new session for a plan
    Run {
        plan: PathBuf,
        /// Allow steps that require elevated privileges
        #[arg(long)]
        confirm_privileged: bool,
    },
    /// Continue a paused or interrupted session
    Resume {
        session: String,
        #[arg(long)]
        confirm_privileged: bool,
    },
    /// Answer a pending decision for a session
    Decide {
        session: String,
        #[arg(value_enum)]
        decision: DecisionArg,
        #[arg(long)]
        confirm_privileged: bool,
    },
    /// Roll a session back
    Rollback {
        session: String,
    },
    /// List sessions, newest first
    Sessions {
        /// Only sessions in this status (pending, running, paused, completed, failed, rolled_back)
        #[arg(long)]
        status: Option<SessionStatus>,
    },
    /// Show a session's steps and attempts
    Show {
        session: String,
    },
    /// Manage backups
    Backups {
        #[command(subcommand)]
        action: BackupCommands,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// List backups, newest first
    List,
    /// Delete one backup and its files
    Delete {
        id: String,
    },
    /// Keep the newest N backups, delete the rest
    Prune {
        #[arg(long)]
        keep: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecisionArg {
    Retry,
    Rollback,
    Skip,
}

impl From<DecisionArg> for Decision {
    fn from(arg: DecisionArg) -> Self {
        match arg {
            DecisionArg::Retry => Decision::Retry,
            DecisionArg::Rollback => Decision::Rollback,
            DecisionArg::Skip => Decision::Skip,
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
