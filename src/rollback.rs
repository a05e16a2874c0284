//! Backups and session rollback
//!
//! A [`Backup`] is a copy of the files a plan says it will touch, taken before
//! the first step and again before every `risky` step. Rolling a session back
//! runs the rollback command of every step that took effect, newest first,
//! and then puts the captured files back. The first reversal that fails stops
//! the whole procedure: the backup is marked partially restored and the
//! blocker is reported so an operator can take over.

use crate::error::{EngineError, Result};
use crate::plan::Step;
use crate::redact;
use crate::runner::{CommandOutput, CommandRunner};
use crate::session::{Session, StepExecution, StepStatus};
use crate::store::{StateStore, now};
use crate::verify::{self, VerifyOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::{Display, EnumString};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackupStatus {
    Complete,
    Restored,
    PartiallyRestored,
}

/// One path captured by a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedPath {
    pub original: PathBuf,
    /// Copy inside the backup directory; `None` when the path did not exist
    pub stored: Option<PathBuf>,
    /// A path that did not exist at capture time is removed on restore
    pub existed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub captured_paths: Vec<CapturedPath>,
    pub status: BackupStatus,
    /// What stopped the last restore, if it did not finish
    pub blocker: Option<String>,
}

/// Append-only audit entry for one reversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub session_id: String,
    pub step_index: Option<u32>,
    pub backup_id: Option<String>,
    pub succeeded: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// Summary of a rollback that ran to the end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub backup_id: Option<String>,
    /// Step indices whose rollback command ran, in execution order
    pub reverted: Vec<u32>,
    /// Steps that took effect but declare no rollback command
    pub irreversible: Vec<u32>,
    pub files_restored: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    /// Backups still needed by a session that may yet roll back
    pub retained_for_sessions: Vec<String>,
}

/// Why a step is part of a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversalReason {
    /// Latest attempt succeeded
    Applied,
    /// Latest attempt failed but the step can undo its partial effects
    FailedAttempt,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reversal {
    pub step: Step,
    pub reason: ReversalReason,
    /// When the attempt being reversed finished
    pub finished_at: Option<DateTime<Utc>>,
}

/// Steps to reverse, in the order their rollback commands must run.
///
/// A failed step that declares a rollback command goes first. Applied steps
/// follow in reverse order of completion; skipped and never-run steps are
/// left alone.
pub fn reversal_order(session: &Session, executions: &[StepExecution]) -> Vec<Reversal> {
    let mut latest: Vec<&StepExecution> = Vec::new();
    for exec in executions {
        match latest.iter_mut().find(|e| e.step_index == exec.step_index) {
            Some(slot) if slot.attempt_number < exec.attempt_number => *slot = exec,
            Some(_) => {}
            None => latest.push(exec),
        }
    }

    let mut failed: Vec<Reversal> = latest
        .iter()
        .filter(|e| e.status == StepStatus::Failed)
        .filter_map(|e| session.plan.step(e.step_index).map(|s| (s, e.finished_at)))
        .filter(|(s, _)| s.rollback_command.is_some())
        .map(|(s, finished_at)| Reversal {
            step: s.clone(),
            reason: ReversalReason::FailedAttempt,
            finished_at,
        })
        .collect();

    let mut applied: Vec<&StepExecution> = latest
        .into_iter()
        .filter(|e| e.status == StepStatus::Succeeded)
        .collect();
    applied.sort_by(|a, b| {
        b.finished_at
            .cmp(&a.finished_at)
            .then_with(|| b.step_index.cmp(&a.step_index))
    });

    failed.extend(applied.into_iter().filter_map(|e| {
        session.plan.step(e.step_index).map(|s| Reversal {
            step: s.clone(),
            reason: ReversalReason::Applied,
            finished_at: e.finished_at,
        })
    }));
    failed
}

pub struct RollbackManager {
    store: StateStore,
    runner: Arc<dyn CommandRunner>,
    backup_dir: PathBuf,
}

impl RollbackManager {
    pub fn new(store: StateStore, runner: Arc<dyn CommandRunner>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            runner,
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Copy `paths` into a fresh backup directory and record it.
    #[instrument(skip(self, paths), fields(paths = paths.len()))]
    pub fn create_backup(
        &self,
        label: &str,
        session_id: Option<&str>,
        paths: &[PathBuf],
    ) -> Result<Backup> {
        let created_at = now();
        let id = format!(
            "backup_{}_{}",
            created_at.format("%Y%m%d_%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let root = self.backup_dir.join(&id);
        fs::create_dir_all(&root)?;

        let mut captured = Vec::with_capacity(paths.len());
        for (n, original) in paths.iter().enumerate() {
            if fs::symlink_metadata(original).is_err() {
                debug!(path = %original.display(), "backup path absent, will be removed on restore");
                captured.push(CapturedPath {
                    original: original.clone(),
                    stored: None,
                    existed: false,
                });
                continue;
            }
            let name = original
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| "root".to_string());
            let stored = root.join(format!("{n:03}_{name}"));
            if let Err(e) = copy_recursively(original, &stored) {
                // Leave no half-written backup behind
                let _ = fs::remove_dir_all(&root);
                return Err(e.into());
            }
            captured.push(CapturedPath {
                original: original.clone(),
                stored: Some(stored),
                existed: true,
            });
        }

        let backup = Backup {
            id,
            label: label.to_string(),
            created_at,
            session_id: session_id.map(str::to_string),
            captured_paths: captured,
            status: BackupStatus::Complete,
            blocker: None,
        };
        self.store.insert_backup(&backup)?;
        info!(backup_id = %backup.id, label, "backup created");
        Ok(backup)
    }

    /// Reverse every applied step of `session`, newest first, then restore
    /// the session's backup.
    ///
    /// Rewinds the session's step cursor as each reversal lands. Does not
    /// change the session status; the caller decides what the result means.
    #[instrument(skip_all, fields(session_id = %session.id))]
    pub fn restore(&self, session: &Session) -> Result<RollbackReport> {
        let executions = self.store.list_step_executions(&session.id)?;
        let history = self.store.list_rollback_records(&session.id)?;
        let order: Vec<Reversal> = reversal_order(session, &executions)
            .into_iter()
            .filter(|r| !already_reverted(&history, r))
            .collect();
        let mut report = RollbackReport {
            backup_id: session.backup_id.clone(),
            ..Default::default()
        };

        info!(reversals = order.len(), "rolling back session");
        for reversal in &order {
            let step = &reversal.step;
            let Some(argv) = &step.rollback_command else {
                warn!(step_index = step.index, step = %step.name, "step has no rollback command, leaving it in place");
                self.log(session, Some(step.index), true, "no rollback command; left in place")?;
                report.irreversible.push(step.index);
                continue;
            };

            match self.reverse_step(step, argv) {
                Ok(()) => {
                    info!(step_index = step.index, step = %step.name, "step reverted");
                    self.log(
                        session,
                        Some(step.index),
                        true,
                        &format!("reverted with `{}`", redact::command_summary(argv)),
                    )?;
                    if let Some(pos) = session.plan.position_of(step.index) {
                        let current = self.store.get_session(&session.id)?.current_step_index;
                        if (pos as u32) < current {
                            self.store.rewind_step_index(&session.id, pos as u32)?;
                        }
                    }
                    report.reverted.push(step.index);
                }
                Err(reason) => {
                    let blocker = format!("step {} ({})", step.index, step.name);
                    return Err(self.blocked(session, Some(step.index), blocker, reason)?);
                }
            }
        }

        if let Some(backup_id) = &session.backup_id {
            let backup = self.store.get_backup(backup_id)?;
            match restore_files(&backup) {
                Ok(count) => report.files_restored = count,
                Err((path, e)) => {
                    let blocker = format!("file {}", path.display());
                    return Err(self.blocked(session, None, blocker, e.to_string())?);
                }
            }
            self.store
                .update_backup_status(backup_id, BackupStatus::Restored, None)?;
            self.log(
                session,
                None,
                true,
                &format!("restored {} file(s) from {backup_id}", report.files_restored),
            )?;
        }

        info!(
            reverted = report.reverted.len(),
            irreversible = report.irreversible.len(),
            files = report.files_restored,
            "rollback finished"
        );
        Ok(report)
    }

    /// Run one rollback command and its check. `Err` carries a redacted reason.
    fn reverse_step(&self, step: &Step, argv: &[String]) -> std::result::Result<(), String> {
        debug!(step_index = step.index, command = %redact::command_summary(argv), "running rollback command");
        let output: CommandOutput = self
            .runner
            .run(argv, step.timeout)
            .map_err(|e| redact::redact(&format!("rollback command could not run: {e:#}")))?;
        if !output.success() {
            return Err(format!(
                "rollback command `{}` failed: {}",
                redact::command_summary(argv),
                output.failure_reason(step.timeout)
            ));
        }
        if let Some(check) = &step.rollback_verification {
            if let VerifyOutcome::Fail(reason) = verify::evaluate(check, &output, self.runner.as_ref()) {
                return Err(format!("rollback verification failed: {reason}"));
            }
        }
        Ok(())
    }

    /// Record the blocker and build the error to return.
    fn blocked(
        &self,
        session: &Session,
        step_index: Option<u32>,
        blocker: String,
        reason: String,
    ) -> Result<EngineError> {
        error!(%blocker, %reason, "rollback blocked, manual remediation required");
        let detail = format!("blocked at {blocker}: {reason}");
        if let Some(backup_id) = &session.backup_id {
            self.store
                .update_backup_status(backup_id, BackupStatus::PartiallyRestored, Some(&detail))?;
        }
        self.log(session, step_index, false, &detail)?;
        Ok(EngineError::RollbackFailed {
            session_id: session.id.clone(),
            backup_id: session.backup_id.clone().unwrap_or_else(|| "-".to_string()),
            step_index,
            blocker,
            reason,
        })
    }

    fn log(&self, session: &Session, step_index: Option<u32>, succeeded: bool, detail: &str) -> Result<()> {
        self.store.append_rollback_record(&RollbackRecord {
            session_id: session.id.clone(),
            step_index,
            backup_id: session.backup_id.clone(),
            succeeded,
            detail: detail.to_string(),
            at: now(),
        })
    }

    pub fn list(&self) -> Result<Vec<Backup>> {
        self.store.list_backups()
    }

    /// Remove a backup's record and its files.
    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.delete_backup(id)?;
        let dir = self.backup_dir.join(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(backup_id = id, "backup directory already gone");
            }
            Err(e) => return Err(e.into()),
        }
        info!(backup_id = id, "backup deleted");
        Ok(())
    }

    /// Keep the newest `keep` backups and delete the rest, except those that
    /// belong to a session which could still roll back.
    pub fn prune(&self, keep: usize) -> Result<PruneReport> {
        let active: HashSet<String> = self
            .store
            .list_sessions(None)?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.id)
            .collect();

        let mut report = PruneReport::default();
        for backup in self.store.list_backups()?.into_iter().skip(keep) {
            if backup.session_id.as_ref().is_some_and(|s| active.contains(s)) {
                report.retained_for_sessions.push(backup.id);
                continue;
            }
            self.delete(&backup.id)?;
            report.deleted.push(backup.id);
        }
        info!(
            deleted = report.deleted.len(),
            retained = report.retained_for_sessions.len(),
            "backups pruned"
        );
        Ok(report)
    }
}

/// A reversal logged as successful after the attempt it undoes.
fn already_reverted(history: &[RollbackRecord], reversal: &Reversal) -> bool {
    history.iter().any(|rec| {
        rec.succeeded
            && rec.step_index == Some(reversal.step.index)
            && reversal.finished_at.is_none_or(|done| rec.at >= done)
    })
}

/// Put every captured path back. `Err` names the path that could not be restored.
fn restore_files(backup: &Backup) -> std::result::Result<usize, (PathBuf, io::Error)> {
    let mut restored = 0;
    for captured in &backup.captured_paths {
        let original = &captured.original;
        remove_path(original).map_err(|e| (original.clone(), e))?;
        if let Some(stored) = captured.stored.as_ref().filter(|_| captured.existed) {
            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent).map_err(|e| (original.clone(), e))?;
            }
            copy_recursively(stored, original).map_err(|e| (original.clone(), e))?;
            restored += 1;
        }
        debug!(path = %original.display(), existed = captured.existed, "path restored");
    }
    Ok(restored)
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copy a file, symlink or directory tree, keeping permissions.
fn copy_recursively(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)?;
    } else if meta.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursively(&entry.path(), &dst.join(entry.file_name()))?;
        }
        fs::set_permissions(dst, meta.permissions())?;
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::tests::{plan, step};
    use crate::runner::ProcessRunner;
    use chrono::Duration as ChronoDuration;

    fn manager(dir: &Path) -> (StateStore, RollbackManager) {
        let store = StateStore::open_in_memory().expect("store");
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::default());
        let mgr = RollbackManager::new(store.clone(), runner, dir.join("backups"));
        (store, mgr)
    }

    fn exec(idx: u32, attempt: u32, status: StepStatus, finished_secs: i64) -> StepExecution {
        let base = now();
        StepExecution::running("s-1", idx, attempt, base).finish(
            status,
            String::new(),
            None,
            Some(0),
            base + ChronoDuration::seconds(finished_secs),
        )
    }

    fn with_rollback(mut s: Step, argv: &[&str]) -> Step {
        s.rollback_command = Some(argv.iter().map(|a| a.to_string()).collect());
        s
    }

    #[test]
    fn test_reversal_order_is_reverse_completion() {
        let session = Session::new(
            "s-1".into(),
            plan(vec![step(1, "a"), step(2, "b"), step(3, "c"), step(4, "d")]),
            now(),
        );
        let execs = vec![
            exec(1, 1, StepStatus::Succeeded, 1),
            exec(2, 1, StepStatus::Failed, 2),
            exec(2, 2, StepStatus::Succeeded, 3),
            exec(3, 1, StepStatus::Succeeded, 4),
            exec(4, 1, StepStatus::Failed, 5),
        ];
        let order: Vec<u32> = reversal_order(&session, &execs).iter().map(|r| r.step.index).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_failed_step_with_rollback_goes_first() {
        let session = Session::new(
            "s-1".into(),
            plan(vec![step(1, "a"), with_rollback(step(2, "b"), &["true"])]),
            now(),
        );
        let execs = vec![exec(1, 1, StepStatus::Succeeded, 1), exec(2, 1, StepStatus::Failed, 2)];
        let order = reversal_order(&session, &execs);
        assert_eq!(order[0].step.index, 2);
        assert_eq!(order[0].reason, ReversalReason::FailedAttempt);
        assert_eq!(order[1].step.index, 1);
    }

    #[test]
    fn test_skipped_steps_are_not_reversed() {
        let session = Session::new("s-1".into(), plan(vec![step(1, "a"), step(2, "b")]), now());
        let execs = vec![exec(1, 1, StepStatus::Skipped, 1), exec(2, 1, StepStatus::Succeeded, 2)];
        let order: Vec<u32> = reversal_order(&session, &execs).iter().map(|r| r.step.index).collect();
        assert_eq!(order, vec![2]);
    }

    #[test]
    fn test_backup_and_restore_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, mgr) = manager(tmp.path());

        let conf = tmp.path().join("daemon.json");
        fs::write(&conf, "{\"log-driver\":\"json-file\"}").expect("write");
        let conf_dir = tmp.path().join("compose");
        fs::create_dir_all(conf_dir.join("nested")).expect("mkdir");
        fs::write(conf_dir.join("nested/a.yml"), "a: 1").expect("write");
        let absent = tmp.path().join("created-later.conf");

        let mut session = Session::new("s-1".into(), plan(vec![step(0, "a")]), now());
        store.create_session(&session).expect("create");
        let backup = mgr
            .create_backup("before plan", Some("s-1"), &[conf.clone(), conf_dir.clone(), absent.clone()])
            .expect("backup");
        assert!(backup.id.starts_with("backup_"));
        assert_eq!(backup.captured_paths.len(), 3);
        assert!(!backup.captured_paths[2].existed);
        session.backup_id = Some(backup.id.clone());

        fs::write(&conf, "mutated").expect("mutate");
        fs::remove_dir_all(&conf_dir).expect("rm");
        fs::write(&absent, "new").expect("create");

        let report = mgr.restore(&session).expect("restore");
        assert_eq!(report.files_restored, 2);
        assert_eq!(fs::read_to_string(&conf).expect("read"), "{\"log-driver\":\"json-file\"}");
        assert_eq!(fs::read_to_string(conf_dir.join("nested/a.yml")).expect("read"), "a: 1");
        assert!(!absent.exists());
        assert_eq!(store.get_backup(&backup.id).expect("get").status, BackupStatus::Restored);
    }

    #[test]
    fn test_failing_rollback_blocks_and_marks_partial() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, mgr) = manager(tmp.path());
        let marker = tmp.path().join("undo.log");
        let append = |tag: &str| {
            vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("echo {tag} >> {}", marker.display()),
            ]
        };

        let mut s1 = step(1, "one");
        s1.rollback_command = Some(append("undo1"));
        let mut s2 = step(2, "two");
        s2.rollback_command = Some(vec!["false".to_string()]);
        let mut s3 = step(3, "three");
        s3.rollback_command = Some(append("undo3"));

        let mut session = Session::new("s-1".into(), plan(vec![s1, s2, s3]), now());
        store.create_session(&session).expect("create");
        let backup = mgr.create_backup("before plan", Some("s-1"), &[]).expect("backup");
        session.backup_id = Some(backup.id.clone());
        store.set_session_backup("s-1", &backup.id).expect("link");
        for (i, idx) in [1u32, 2, 3].iter().enumerate() {
            store
                .upsert_step_execution(&exec(*idx, 1, StepStatus::Succeeded, i as i64))
                .expect("row");
        }
        store.advance_step_index("s-1", 3).expect("advance");

        let err = mgr.restore(&session).unwrap_err();
        match &err {
            EngineError::RollbackFailed { step_index, blocker, .. } => {
                assert_eq!(*step_index, Some(2));
                assert!(blocker.contains("two"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        assert_eq!(fs::read_to_string(&marker).expect("marker"), "undo3\n");
        let stored = store.get_backup(&backup.id).expect("get");
        assert_eq!(stored.status, BackupStatus::PartiallyRestored);
        assert!(stored.blocker.expect("blocker").contains("step 2"));
        assert_eq!(store.get_session("s-1").expect("get").current_step_index, 2);

        let log = store.list_rollback_records("s-1").expect("log");
        assert_eq!(log.len(), 2);
        assert!(log[0].succeeded);
        assert!(!log[1].succeeded);
        assert_eq!(log[1].step_index, Some(2));
    }

    #[test]
    fn test_second_rollback_does_not_repeat_reversals() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, mgr) = manager(tmp.path());
        let marker = tmp.path().join("undo.log");
        let mut s1 = step(1, "one");
        s1.rollback_command = Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("echo undo1 >> {}", marker.display()),
        ]);
        let session = Session::new("s-1".into(), plan(vec![s1]), now());
        store.create_session(&session).expect("create");
        store
            .upsert_step_execution(&exec(1, 1, StepStatus::Succeeded, 0))
            .expect("row");

        assert_eq!(mgr.restore(&session).expect("first").reverted, vec![1]);
        assert!(mgr.restore(&session).expect("second").reverted.is_empty());
        assert_eq!(fs::read_to_string(&marker).expect("marker"), "undo1\n");
    }

    #[test]
    fn test_prune_keeps_newest_and_active_sessions() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (store, mgr) = manager(tmp.path());
        let session = Session::new("live".into(), plan(vec![step(0, "a")]), now());
        store.create_session(&session).expect("create");

        let oldest = mgr.create_backup("oldest", Some("live"), &[]).expect("b1");
        let middle = mgr.create_backup("middle", None, &[]).expect("b2");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newest = mgr.create_backup("newest", None, &[]).expect("b3");

        let report = mgr.prune(1).expect("prune");
        let remaining: Vec<String> = mgr.list().expect("list").into_iter().map(|b| b.id).collect();
        assert!(remaining.contains(&newest.id));
        assert!(remaining.contains(&oldest.id));
        assert_eq!(report.retained_for_sessions, vec![oldest.id.clone()]);
        assert_eq!(report.deleted, vec![middle.id.clone()]);
        assert!(!mgr.backup_dir().join(&middle.id).exists());
    }

    #[test]
    fn test_delete_unknown_backup_is_not_found() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_store, mgr) = manager(tmp.path());
        let err = mgr.delete("backup_nope").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
