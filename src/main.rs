//! Homestead - command-line entry point

use anyhow::{Context, Result};
use homestead::cli::{BackupCommands, Cli, Commands};
use homestead::engine::{Engine, Preview, PrivilegeConfirmation, RunOutcome, RunReport};
use homestead::error::{EngineError, ErrorKind};
use homestead::plan::Plan;
use homestead::process_guard::{self, ProcessGuard};
use homestead::store::StateStore;
use homestead::EngineConfig;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit codes, stable for scripting
mod exit {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const INVALID: i32 = 2;
    pub const PAUSED: i32 = 3;
    pub const FAILED: i32 = 4;
    pub const ROLLBACK_FAILED: i32 = 5;
    pub const LOCKED: i32 = 6;
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);
    debug!("CLI arguments parsed");

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("✗ {e:#}");
            error_exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = EngineConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = cli.state_db {
        config.state_db = db;
    }

    // Commands that never touch the state database
    match &cli.command {
        Commands::Validate { plan } => {
            let plan = Plan::load_from_file(plan)?;
            plan.validate().map_err(EngineError::from)?;
            println!("✓ Plan '{}' is valid ({} steps)", plan.title, plan.steps.len());
            return Ok(exit::OK);
        }
        Commands::Preview { plan } => {
            let plan = Plan::load_from_file(plan)?;
            let engine = Engine::new(StateStore::open_in_memory()?, config);
            print_preview(&engine.preview(&plan)?);
            return Ok(exit::OK);
        }
        _ => {}
    }

    let store = StateStore::open(&config.state_db)
        .with_context(|| format!("Failed to open state database {:?}", config.state_db))?;
    let _guard = ProcessGuard::new(config.kill_grace());
    let mut engine = Engine::new(store.clone(), config.clone());

    let token = engine.cancel_token();
    if let Err(e) = process_guard::init_signal_handlers(config.kill_grace(), move |_| token.cancel()) {
        warn!(error = %e, "failed to install signal handlers");
    }

    match cli.command {
        Commands::Validate { .. } | Commands::Preview { .. } => Ok(exit::OK),
        Commands::Run {
            plan,
            confirm_privileged,
        } => {
            let plan = Plan::load_from_file(&plan)?;
            if confirm_privileged {
                engine.confirm_privileged(PrivilegeConfirmation::for_plan(&plan));
            }
            info!(plan_id = %plan.id, "starting plan");
            Ok(print_report(&engine.start(plan)?))
        }
        Commands::Resume {
            session,
            confirm_privileged,
        } => {
            if confirm_privileged {
                let plan = store.get_session(&session)?.plan;
                engine.confirm_privileged(PrivilegeConfirmation::for_plan(&plan));
            }
            Ok(print_report(&engine.resume(&session)?))
        }
        Commands::Decide {
            session,
            decision,
            confirm_privileged,
        } => {
            if confirm_privileged {
                let plan = store.get_session(&session)?.plan;
                engine.confirm_privileged(PrivilegeConfirmation::for_plan(&plan));
            }
            Ok(print_report(&engine.decide(&session, decision.into())?))
        }
        Commands::Rollback { session } => Ok(print_report(&engine.rollback(&session)?)),
        Commands::Sessions { status } => {
            let sessions = store.list_sessions(status)?;
            if sessions.is_empty() {
                println!("No sessions");
            }
            for s in sessions {
                let (done, total) = s.progress();
                println!(
                    "{}  {:<11}  {}/{}  {}  {}",
                    s.id,
                    s.status.to_string(),
                    done,
                    total,
                    s.started_at.format("%Y-%m-%d %H:%M:%S"),
                    s.plan.title
                );
            }
            Ok(exit::OK)
        }
        Commands::Show { session } => {
            show_session(&store, &session)?;
            Ok(exit::OK)
        }
        Commands::Backups { action } => {
            let backups = engine.backups();
            match action {
                BackupCommands::List => {
                    let list = backups.list()?;
                    if list.is_empty() {
                        println!("No backups");
                    }
                    for b in list {
                        println!(
                            "{}  {:<18}  {} path(s)  {}  {}",
                            b.id,
                            b.status.to_string(),
                            b.captured_paths.len(),
                            b.session_id.as_deref().unwrap_or("-"),
                            b.label
                        );
                        if let Some(blocker) = b.blocker {
                            println!("    blocked: {blocker}");
                        }
                    }
                }
                BackupCommands::Delete { id } => {
                    backups.delete(&id)?;
                    println!("✓ Deleted backup {id}");
                }
                BackupCommands::Prune { keep } => {
                    let report = backups.prune(keep)?;
                    println!("✓ Deleted {} backup(s)", report.deleted.len());
                    for id in report.retained_for_sessions {
                        println!("  kept {id} (session may still roll back)");
                    }
                }
            }
            Ok(exit::OK)
        }
    }
}

fn print_preview(preview: &Preview) {
    println!("Plan '{}' ({})", preview.title, preview.plan_id);
    for step in &preview.steps {
        let mut flags = Vec::new();
        if step.privileged {
            flags.push("privileged");
        }
        if step.risky {
            flags.push("risky");
        }
        println!(
            "  [{}] {}{}",
            step.index,
            step.name,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            }
        );
        println!("      run:      {}", step.command);
        println!("      verify:   {}", step.verification);
        if let Some(rollback) = &step.rollback {
            println!("      rollback: {rollback}");
        }
        println!(
            "      attempts: {}, timeout: {}s",
            step.max_attempts, step.timeout_secs
        );
    }
    for finding in &preview.findings {
        println!(
            "  {} {}: {}",
            finding.severity.to_string().to_uppercase(),
            finding.check_name,
            finding.message
        );
    }
}

fn print_report(report: &RunReport) -> i32 {
    for w in &report.warnings {
        println!("! {}: {}", w.check_name, w.message);
    }
    let id = &report.session_id;
    match &report.outcome {
        RunOutcome::Completed => {
            println!("✓ Session {id} completed");
            exit::OK
        }
        RunOutcome::RolledBack { rollback } => {
            println!(
                "✓ Session {id} rolled back ({} step(s) reverted, {} file(s) restored)",
                rollback.reverted.len(),
                rollback.files_restored
            );
            if !rollback.irreversible.is_empty() {
                println!("  left in place (no rollback command): {:?}", rollback.irreversible);
            }
            exit::OK
        }
        RunOutcome::Paused { reason } => {
            println!("⏸ Session {id} paused: {reason}");
            println!("  resume with: homestead resume {id}");
            exit::PAUSED
        }
        RunOutcome::DecisionRequired(req) => {
            println!("⏸ Session {id} needs a decision");
            println!("  {}", req.failure);
            println!("  {} attempt(s); {}", req.attempts, req.exhaustion);
            for r in &req.remediations {
                println!("  - [{}] {}", r.kind, r.summary);
                if let Some(cmd) = &r.command {
                    println!("      {}", cmd.join(" "));
                }
            }
            println!("  answer with: homestead decide {id} <retry|rollback|skip>");
            exit::PAUSED
        }
        RunOutcome::Failed {
            failure,
            rollback,
            remediations,
        } => {
            println!("✗ Session {id} failed: {failure}");
            println!(
                "  rolled back {} step(s), restored {} file(s)",
                rollback.reverted.len(),
                rollback.files_restored
            );
            for r in remediations {
                println!("  - [{}] {}", r.kind, r.summary);
            }
            exit::FAILED
        }
        RunOutcome::FinishedWithSkips { skipped } => {
            println!("✗ Session {id} finished with skipped steps: {skipped:?}");
            exit::FAILED
        }
    }
}

fn show_session(store: &StateStore, id: &str) -> Result<()> {
    let session = store.get_session(id)?;
    let (done, total) = session.progress();
    println!("Session {} - {}", session.id, session.plan.title);
    println!("  status:  {} ({})", session.status, session.status.description());
    println!("  step:    {done}/{total}");
    println!("  breaker: {}", session.breaker.state());
    if let Some(backup) = &session.backup_id {
        println!("  backup:  {backup}");
    }
    if let Some(err) = &session.last_error {
        println!("  last:    {err}");
    }

    let executions = store.list_step_executions(id)?;
    for step in &session.plan.steps {
        println!("  [{}] {}", step.index, step.name);
        for e in executions.iter().filter(|e| e.step_index == step.index) {
            println!(
                "      #{} {:<9} exit={} kind={}",
                e.attempt_number,
                e.status.to_string(),
                e.exit_code.map_or("-".to_string(), |c| c.to_string()),
                e.error_kind.map_or("-".to_string(), |k| k.to_string())
            );
            if let Some(line) = e.output_excerpt.lines().last() {
                println!("          {line}");
            }
        }
    }

    let log = store.list_rollback_records(id)?;
    if !log.is_empty() {
        println!("  rollback log:");
        for rec in log {
            println!(
                "    {} {} {}",
                rec.at.format("%H:%M:%S"),
                if rec.succeeded { "ok  " } else { "FAIL" },
                rec.detail
            );
        }
    }
    Ok(())
}

fn error_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EngineError>().map(EngineError::kind) {
        Some(ErrorKind::Validation | ErrorKind::PreflightBlocked) => exit::INVALID,
        Some(ErrorKind::RollbackFailed) => exit::ROLLBACK_FAILED,
        Some(ErrorKind::SessionLocked) => exit::LOCKED,
        _ => exit::ERROR,
    }
}
